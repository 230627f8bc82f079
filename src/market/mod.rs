pub mod model;
pub mod window;

pub use model::{MarketModel, MarketSnapshot};
pub use window::{Bar, RollingWindow};
