pub mod driver;
pub mod playwright_driver;

#[cfg(test)]
pub mod mock;

pub use driver::{BrowserDriver, RawElement, RawOption};
