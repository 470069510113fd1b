// Checkout core
pub mod checkout;
pub mod coupons;
pub mod order_ledger;
pub mod pricing;
pub mod reconciliation;

// Background jobs
pub mod sweeper;

use std::future::Future;
use std::time::Duration;

use crate::errors::ServiceError;

/// Bounds an external call. Nothing in the checkout core waits forever.
pub(crate) async fn with_timeout<T, E, F>(
    duration: Duration,
    operation: &str,
    fut: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ServiceError>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ServiceError::Timeout(format!(
            "{} exceeded {:?}",
            operation, duration
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn with_timeout_maps_elapsed() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, ServiceError>(())
        };
        assert_matches!(
            with_timeout(Duration::from_millis(5), "catalog read", slow).await,
            Err(ServiceError::Timeout(msg)) if msg.contains("catalog read")
        );
        assert_eq!(
            with_timeout(Duration::from_secs(1), "x", async { Ok::<_, ServiceError>(7) })
                .await
                .unwrap(),
            7
        );
    }
}
