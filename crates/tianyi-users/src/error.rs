use thiserror::Error;
use tianyi_core::error::TianyiError;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("用户名或密码错误")]
    InvalidCredentials,

    #[error("消息令牌无效或已过期")]
    TokenInvalid,

    #[error("邀请码无效")]
    InviteInvalid,

    #[error("邀请码已被使用")]
    InviteUsed,

    #[error("用户名已存在")]
    UsernameTaken,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    Store(#[from] tianyi_store::StoreError),
}

impl From<UserError> for TianyiError {
    fn from(e: UserError) -> Self {
        match e {
            UserError::InvalidCredentials | UserError::TokenInvalid => {
                TianyiError::AuthFailed(e.to_string())
            }
            UserError::InviteInvalid | UserError::InviteUsed | UserError::UsernameTaken => {
                TianyiError::Validation(e.to_string())
            }
            UserError::Hash(msg) => TianyiError::Internal(msg),
            UserError::Database(err) => TianyiError::Database(err.to_string()),
            UserError::Store(err) => err.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UserError>;
