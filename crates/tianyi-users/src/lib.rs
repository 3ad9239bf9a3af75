pub mod account;
pub mod error;

pub use account::{AccountService, LoginTokens};
pub use error::{Result, UserError};
