// checker — Probe executors.
// One executor per check type, behind a common async trait. The
// executors never retry and never talk to storage; they turn one
// network exchange into one CheckResult.

use async_trait::async_trait;

use crate::errors::MonitorError;
use crate::types::{CheckConfig, CheckResult, CheckType};

mod http;
mod ssl;
mod tcp;

pub use http::HttpChecker;
pub use ssl::SslChecker;
pub use tcp::TcpChecker;

/// Contract shared by all probe executors: consume a CheckConfig,
/// produce exactly one CheckResult. Failures are encoded in the
/// result's status, never thrown.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, check: &CheckConfig) -> CheckResult;
    fn name(&self) -> &'static str;
}

/// Closed dispatch over the check types. Adding a new probe kind
/// means extending CheckType and this set together.
pub struct CheckerSet {
    http: HttpChecker,
    tcp: TcpChecker,
    ssl: SslChecker,
}

impl CheckerSet {
    pub fn new(user_agent: &str) -> Result<Self, MonitorError> {
        Ok(CheckerSet {
            http: HttpChecker::new(user_agent)?,
            tcp: TcpChecker::new(),
            ssl: SslChecker::new()?,
        })
    }

    pub fn checker(&self, check_type: CheckType) -> &dyn Checker {
        match check_type {
            CheckType::Http => &self.http,
            CheckType::Tcp => &self.tcp,
            CheckType::Ssl => &self.ssl,
        }
    }

    /// Run the type-appropriate executor for one check.
    pub async fn run(&self, check: &CheckConfig) -> CheckResult {
        self.checker(check.check_type).check(check).await
    }
}
