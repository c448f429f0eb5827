use std::time::Duration;

/// Activity failure with retry classification.
///
/// `Transient` covers conditions worth retrying (timeouts, resource
/// exhaustion); `Fatal` covers conditions where retrying cannot help
/// (invalid input, permanent rejection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    Transient(String),
    Fatal(String),
}

impl ActivityError {
    pub fn reason(&self) -> &str {
        match self {
            ActivityError::Transient(r) | ActivityError::Fatal(r) => r,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Transient(r) => write!(f, "transient: {r}"),
            ActivityError::Fatal(r) => write!(f, "fatal: {r}"),
        }
    }
}

impl std::error::Error for ActivityError {}

/// One unit of long-running work.
///
/// The coordinator may invoke the same handler several times for one
/// instance (retry after a transient failure, resume after a crash), so
/// implementations must be idempotent or side-effect-free on repeat runs.
#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn run(&self, input: String) -> Result<String, ActivityError>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait::async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn run(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

/// The sample unit of work: wait `input` seconds, then report success.
///
/// A malformed duration is a `Fatal` failure; waiting again would not fix it.
pub async fn delay_activity(input: String) -> Result<String, ActivityError> {
    let secs: u64 = input
        .trim()
        .parse()
        .map_err(|_| ActivityError::Fatal(format!("invalid delay seconds: {input:?}")))?;
    tokio::time::sleep(Duration::from_secs(secs)).await;
    Ok(format!("{secs}s-wait-ok"))
}
