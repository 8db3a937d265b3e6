//! Single-row lease deletion inside a caller-owned transaction

use crate::database::Transaction;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

const DELETE_SUBNET: &str = "DELETE FROM subnets WHERE underlay_ip = ?";

/// Deletes the lease row of one underlay host and reports the affected rows.
///
/// Committing or rolling back is left to the owner of the transaction.
#[async_trait]
pub trait SubnetDeleter: Send + Sync {
    /// Delete the row for `underlay_ip`, returning the affected-row count
    async fn delete(
        &self,
        tx: &mut dyn Transaction,
        underlay_ip: &str,
        timeout: Duration,
    ) -> Result<u64>;
}

/// Default deleter issuing a parameterised `DELETE`
#[derive(Debug, Clone, Copy, Default)]
pub struct Deleter;

#[async_trait]
impl SubnetDeleter for Deleter {
    async fn delete(
        &self,
        tx: &mut dyn Transaction,
        underlay_ip: &str,
        timeout: Duration,
    ) -> Result<u64> {
        let sql = tx.rebind(DELETE_SUBNET);
        tx.execute("deleting entry", &sql, &[underlay_ip.into()], timeout)
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeTransaction;
    use super::*;
    use crate::database::SqlValue;
    use crate::StoreError;

    #[tokio::test]
    async fn test_delete_executes_rebound_query() {
        let mut tx = FakeTransaction::returning(Ok(1));

        let rows = Deleter
            .delete(&mut tx, "underlay", Duration::from_secs(4))
            .await
            .unwrap();

        assert_eq!(rows, 1);
        assert_eq!(
            *tx.rebind_calls.lock().unwrap(),
            vec!["DELETE FROM subnets WHERE underlay_ip = ?".to_string()]
        );
        assert_eq!(tx.execute_calls.len(), 1);
        let (sql, params, timeout) = &tx.execute_calls[0];
        assert_eq!(sql, "rebinded query");
        assert_eq!(params, &vec![SqlValue::Text("underlay".to_string())]);
        assert_eq!(*timeout, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_delete_returns_execute_error() {
        let mut tx = FakeTransaction::returning(Err(StoreError::Timeout {
            operation: "deleting entry",
            timeout: Duration::from_secs(4),
        }));

        let err = Deleter
            .delete(&mut tx, "underlay", Duration::from_secs(4))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Timeout { .. }));
    }
}
