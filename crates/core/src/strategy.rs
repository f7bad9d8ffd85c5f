//! Collaborator traits the cycle hands its analysis to.
//!
//! The engine only gathers data and sequences calls. Deciding what a
//! token's data means ([`StrategyEngine`]) and acting on it
//! ([`PositionPolicy`]) is left to the host.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokenpulse_market_data::{PricePoint, TokenId, TokenInfo};

/// Everything the cycle gathered about one token.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSnapshot {
    pub token: TokenInfo,
    pub price: Decimal,
    /// Historical series, oldest first.
    pub history: Vec<PricePoint>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Outcome of evaluating one token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub token: TokenId,
    pub action: SignalAction,
    /// Confidence between 0 and 1.
    pub confidence: Decimal,
    pub reason: String,
}

impl Signal {
    pub fn new(
        token: TokenId,
        action: SignalAction,
        confidence: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            token,
            action,
            confidence: confidence.clamp(Decimal::ZERO, Decimal::ONE),
            reason: reason.into(),
        }
    }

    pub fn hold(token: TokenId, reason: impl Into<String>) -> Self {
        Self::new(token, SignalAction::Hold, Decimal::ZERO, reason)
    }

    /// Whether the signal asks for a trade.
    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::Hold
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionActionKind {
    Close,
    Adjust,
}

/// Action requested by the position check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionAction {
    pub token: TokenId,
    pub kind: PositionActionKind,
    pub reason: String,
}

impl PositionAction {
    pub fn close(token: TokenId, reason: impl Into<String>) -> Self {
        Self {
            token,
            kind: PositionActionKind::Close,
            reason: reason.into(),
        }
    }

    pub fn adjust(token: TokenId, reason: impl Into<String>) -> Self {
        Self {
            token,
            kind: PositionActionKind::Adjust,
            reason: reason.into(),
        }
    }
}

/// Turns a token snapshot into a trading signal.
#[async_trait]
pub trait StrategyEngine: Send + Sync {
    async fn evaluate(&self, snapshot: &TokenSnapshot) -> anyhow::Result<Signal>;
}

/// Owns open positions and reacts to signals and prices.
#[async_trait]
pub trait PositionPolicy: Send + Sync {
    /// Called for every signal the strategy produced, with the price it saw.
    async fn on_signal(&self, signal: &Signal, price: Decimal) -> anyhow::Result<()>;

    /// Tokens with an open position; their prices are refreshed each cycle.
    async fn open_positions(&self) -> anyhow::Result<Vec<TokenId>>;

    /// Inspect open positions against fresh prices.
    async fn check_positions(
        &self,
        prices: &HashMap<TokenId, Decimal>,
    ) -> anyhow::Result<Vec<PositionAction>>;
}

/// Position policy that holds nothing and never acts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPositions;

#[async_trait]
impl PositionPolicy for NoPositions {
    async fn on_signal(&self, _signal: &Signal, _price: Decimal) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open_positions(&self) -> anyhow::Result<Vec<TokenId>> {
        Ok(Vec::new())
    }

    async fn check_positions(
        &self,
        _prices: &HashMap<TokenId, Decimal>,
    ) -> anyhow::Result<Vec<PositionAction>> {
        Ok(Vec::new())
    }
}
