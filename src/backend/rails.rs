//! Funds rails between depositors and the vault's liquid buffer.
//!
//! The vault only relies on the two-call contract below; how funds actually
//! move (token transfer, internal book entry) is up to the implementation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

/// Source/sink for the vault's own liquid buffer.
#[async_trait]
pub trait FundsRail: Send + Sync {
    /// Release up to `amount`, never dropping the rail below `min_reserve`.
    /// Returns the amount released.
    async fn withdraw_up_to(&self, amount: Decimal, min_reserve: Decimal)
        -> anyhow::Result<Decimal>;

    /// Accept up to `amount`. Returns the amount accepted.
    async fn accept_up_to(&self, amount: Decimal) -> anyhow::Result<Decimal>;
}

/// In-memory buffer with an optional capacity ceiling.
pub struct LiquidBuffer {
    balance: Mutex<Decimal>,
    capacity: Option<Decimal>,
}

impl LiquidBuffer {
    /// Unbounded empty buffer.
    pub fn new() -> Self {
        Self {
            balance: Mutex::new(Decimal::ZERO),
            capacity: None,
        }
    }

    /// Empty buffer that holds at most `capacity`.
    pub fn with_capacity(capacity: Decimal) -> Self {
        Self {
            balance: Mutex::new(Decimal::ZERO),
            capacity: Some(capacity),
        }
    }

    pub async fn balance(&self) -> Decimal {
        *self.balance.lock().await
    }
}

impl Default for LiquidBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FundsRail for LiquidBuffer {
    async fn withdraw_up_to(
        &self,
        amount: Decimal,
        min_reserve: Decimal,
    ) -> anyhow::Result<Decimal> {
        anyhow::ensure!(amount >= Decimal::ZERO, "negative withdrawal {}", amount);
        let mut balance = self.balance.lock().await;
        let available = (*balance - min_reserve).max(Decimal::ZERO);
        let released = amount.min(available);
        *balance -= released;
        debug!(%amount, %released, balance = %*balance, "Buffer release");
        Ok(released)
    }

    async fn accept_up_to(&self, amount: Decimal) -> anyhow::Result<Decimal> {
        anyhow::ensure!(amount >= Decimal::ZERO, "negative deposit {}", amount);
        let mut balance = self.balance.lock().await;
        let accepted = match self.capacity {
            Some(capacity) => amount.min((capacity - *balance).max(Decimal::ZERO)),
            None => amount,
        };
        *balance += accepted;
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_release_respects_reserve() {
        let buffer = LiquidBuffer::new();
        buffer.accept_up_to(dec!(100)).await.unwrap();

        let released = buffer.withdraw_up_to(dec!(80), dec!(30)).await.unwrap();
        assert_eq!(released, dec!(70));
        assert_eq!(buffer.balance().await, dec!(30));
    }

    #[tokio::test]
    async fn test_capacity_limits_acceptance() {
        let buffer = LiquidBuffer::with_capacity(dec!(50));
        assert_eq!(buffer.accept_up_to(dec!(40)).await.unwrap(), dec!(40));
        assert_eq!(buffer.accept_up_to(dec!(40)).await.unwrap(), dec!(10));
        assert_eq!(buffer.balance().await, dec!(50));
    }
}
