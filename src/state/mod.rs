pub mod view;

pub use view::{Freshness, ViewState};
