use std::borrow::Cow;
use std::sync::Arc;

/// Provider identifier - mostly static constants
pub type ProviderId = Cow<'static, str>;

/// Token identifier (mint address, contract address or provider slug)
pub type TokenId = Arc<str>;
