use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::futures::CircuitBreaker;
use failsafe::{Config, Error, StateMachine};
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

/// Breaker shared by every call to one external provider.
pub type ProviderBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for an outbound provider (email, voice, language model).
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// While open, calls fail fast with [`AppError::ExternalApiError`] instead of
/// waiting on a provider that is already down.
pub fn create_provider_circuit_breaker() -> ProviderBreaker {
    let backoff_strategy = backoff::exponential(Duration::from_secs(10), Duration::from_secs(60));
    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);
    Config::new().failure_policy(failure_policy).build()
}

/// Runs `request` through `breaker`, flattening rejection into the provider error.
pub async fn guarded<T, F>(
    breaker: &ProviderBreaker,
    provider: &str,
    request: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match breaker.call(request).await {
        Ok(value) => Ok(value),
        Err(Error::Inner(e)) => Err(e),
        Err(Error::Rejected) => {
            tracing::warn!("{} circuit open, rejecting call", provider);
            Err(AppError::ExternalApiError(format!(
                "{} temporarily unavailable (circuit open)",
                provider
            )))
        }
    }
}
