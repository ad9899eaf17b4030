//! The syscall surface: every host access a module makes goes through here.
//!
//! A call is allowed only when the module's manifest lists it in
//! `allowedSyscalls` and one of the module's capabilities validates for the
//! call's resource, path and rights.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use capsule_kernel_caps::{CapabilityEngine, CapabilityError, CapabilityToken, ResourceType, Rights};
use capsule_kernel_core::SharedClock;
use capsule_kernel_ipc::Router;
use capsule_kernel_sched::ProcessId;

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KernelError, Result};

/// Syscall names as they appear in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyscallKind {
    Now,
    StorageRead,
    StorageWrite,
    NetworkFetch,
    AuditAppend,
}

impl SyscallKind {
    /// Resource type and rights a capability must grant for this call.
    pub fn requirement(&self) -> (ResourceType, Rights) {
        match self {
            SyscallKind::Now => (ResourceType::Clock, Rights::read_only()),
            SyscallKind::StorageRead => (ResourceType::Storage, Rights::read_only()),
            SyscallKind::StorageWrite => (ResourceType::Storage, Rights::write_only()),
            SyscallKind::NetworkFetch => (ResourceType::Network, Rights::execute_only()),
            SyscallKind::AuditAppend => (ResourceType::AuditLog, Rights::write_only()),
        }
    }
}

impl fmt::Display for SyscallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyscallKind::Now => "now",
            SyscallKind::StorageRead => "storageRead",
            SyscallKind::StorageWrite => "storageWrite",
            SyscallKind::NetworkFetch => "networkFetch",
            SyscallKind::AuditAppend => "auditAppend",
        };
        f.write_str(s)
    }
}

/// A syscall with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Syscall {
    Now,
    StorageRead { key: String },
    StorageWrite { key: String, value: Value },
    NetworkFetch { url: String },
    AuditAppend { category: String, message: String },
}

impl Syscall {
    pub fn kind(&self) -> SyscallKind {
        match self {
            Syscall::Now => SyscallKind::Now,
            Syscall::StorageRead { .. } => SyscallKind::StorageRead,
            Syscall::StorageWrite { .. } => SyscallKind::StorageWrite,
            Syscall::NetworkFetch { .. } => SyscallKind::NetworkFetch,
            Syscall::AuditAppend { .. } => SyscallKind::AuditAppend,
        }
    }

    /// Resource path the capability pattern is matched against.
    pub fn path(&self) -> &str {
        match self {
            Syscall::Now => "now",
            Syscall::StorageRead { key } | Syscall::StorageWrite { key, .. } => key,
            Syscall::NetworkFetch { url } => url,
            Syscall::AuditAppend { category, .. } => category,
        }
    }
}

/// Host-side network access. The kernel never opens sockets itself.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<Value, String>;
}

/// Default fetcher: refuses everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyNetwork;

#[async_trait]
impl NetworkFetcher for DenyNetwork {
    async fn fetch(&self, url: &str) -> std::result::Result<Value, String> {
        Err(format!("network access disabled ({})", url))
    }
}

/// Shared state behind every module's syscalls.
pub struct SyscallHost {
    caps: Arc<CapabilityEngine>,
    router: Arc<Router>,
    clock: SharedClock,
    audit: Arc<AuditLog>,
    fetcher: Arc<dyn NetworkFetcher>,
    storage: RwLock<BTreeMap<String, Value>>,
}

impl SyscallHost {
    pub fn new(
        caps: Arc<CapabilityEngine>,
        router: Arc<Router>,
        clock: SharedClock,
        audit: Arc<AuditLog>,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Self {
        Self {
            caps,
            router,
            clock,
            audit,
            fetcher,
            storage: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Read a storage key directly, bypassing capabilities. For the host.
    pub fn storage_get(&self, key: &str) -> Option<Value> {
        self.storage
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn storage_put(&self, key: String, value: Value) -> Option<Value> {
        self.storage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value)
    }
}

/// The syscall handle given to one module for one dispatch.
pub struct Syscalls<'a> {
    module_id: &'a str,
    pid: ProcessId,
    allowed: &'a [SyscallKind],
    tokens: &'a [CapabilityToken],
    host: &'a SyscallHost,
}

impl<'a> Syscalls<'a> {
    pub fn new(
        module_id: &'a str,
        pid: ProcessId,
        allowed: &'a [SyscallKind],
        tokens: &'a [CapabilityToken],
        host: &'a SyscallHost,
    ) -> Self {
        Self {
            module_id,
            pid,
            allowed,
            tokens,
            host,
        }
    }

    pub fn module_id(&self) -> &str {
        self.module_id
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Kernel time for sealing. Not a syscall; modules read time through
    /// [`Syscalls::now`].
    pub(crate) fn kernel_time(&self) -> i64 {
        self.host.clock.now_millis()
    }

    /// Mailbox owner lookup.
    pub fn resolve(&self, name: &str) -> Option<ProcessId> {
        self.host.router.resolve(name)
    }

    /// Authorize and execute a syscall.
    pub async fn invoke(&self, call: Syscall) -> Result<Value> {
        self.authorize(&call)?;
        match call {
            Syscall::Now => Ok(json!(self.host.clock.now_millis())),
            Syscall::StorageRead { key } => Ok(self.host.storage_get(&key).unwrap_or(Value::Null)),
            Syscall::StorageWrite { key, value } => {
                Ok(self.host.storage_put(key, value).unwrap_or(Value::Null))
            }
            Syscall::NetworkFetch { url } => self
                .host
                .fetcher
                .fetch(&url)
                .await
                .map_err(KernelError::NetworkDenied),
            Syscall::AuditAppend { category, message } => {
                let entry = self
                    .host
                    .audit
                    .append(self.module_id, AuditEvent::Custom { category, message });
                Ok(json!(entry.sequence))
            }
        }
    }

    pub async fn now(&self) -> Result<i64> {
        let v = self.invoke(Syscall::Now).await?;
        v.as_i64()
            .ok_or_else(|| KernelError::Invariant("clock returned a non-integer".into()))
    }

    pub async fn storage_read(&self, key: &str) -> Result<Option<Value>> {
        let v = self.invoke(Syscall::StorageRead { key: key.into() }).await?;
        Ok((!v.is_null()).then_some(v))
    }

    pub async fn storage_write(&self, key: &str, value: Value) -> Result<()> {
        self.invoke(Syscall::StorageWrite {
            key: key.into(),
            value,
        })
        .await
        .map(|_| ())
    }

    pub async fn fetch(&self, url: &str) -> Result<Value> {
        self.invoke(Syscall::NetworkFetch { url: url.into() }).await
    }

    pub async fn audit_append(&self, category: &str, message: &str) -> Result<u64> {
        let v = self
            .invoke(Syscall::AuditAppend {
                category: category.into(),
                message: message.into(),
            })
            .await?;
        Ok(v.as_u64().unwrap_or_default())
    }

    fn authorize(&self, call: &Syscall) -> Result<()> {
        let kind = call.kind();
        if !self.allowed.contains(&kind) {
            self.deny(kind, "not in allowedSyscalls");
            return Err(KernelError::SyscallNotAllowed {
                module_id: self.module_id.to_string(),
                syscall: kind.to_string(),
            });
        }

        let (resource_type, rights) = kind.requirement();
        let mut last: Option<CapabilityError> = None;
        for token in self.tokens {
            match self.host.caps.check(token, &resource_type, call.path(), rights) {
                Ok(cap) => {
                    debug!(module = %self.module_id, syscall = %kind, cap = %cap.id, "syscall authorized");
                    return Ok(());
                }
                Err(err) => {
                    // a mismatched type says nothing about this call
                    if !matches!(err, CapabilityError::ResourceTypeMismatch { .. }) || last.is_none() {
                        last = Some(err);
                    }
                }
            }
        }

        let err = last.unwrap_or(CapabilityError::InvalidToken);
        self.deny(kind, err.reason_code());
        Err(KernelError::Capability(err))
    }

    fn deny(&self, kind: SyscallKind, reason: &str) {
        warn!(module = %self.module_id, syscall = %kind, reason, "syscall denied");
        self.host.audit.append(
            "syscall",
            AuditEvent::SyscallDenied {
                module_id: self.module_id.to_string(),
                syscall: kind.to_string(),
                reason: reason.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditConfig;
    use capsule_kernel_caps::CapabilitySpec;
    use capsule_kernel_core::{Clock, ManualClock};
    use std::time::Duration;

    struct Fixture {
        caps: Arc<CapabilityEngine>,
        audit: Arc<AuditLog>,
        host: SyscallHost,
    }

    fn fixture(fetcher: Arc<dyn NetworkFetcher>) -> Fixture {
        let clock: SharedClock = Arc::new(ManualClock::new(5_000));
        let caps = Arc::new(CapabilityEngine::new(clock.clone()));
        let router = Arc::new(Router::new(caps.clone(), clock.clone(), Duration::from_millis(50)));
        let audit = Arc::new(AuditLog::new(AuditConfig::default(), clock.clone()));
        let host = SyscallHost::new(caps.clone(), router, clock, audit.clone(), fetcher);
        Fixture { caps, audit, host }
    }

    fn issue(caps: &CapabilityEngine, rt: ResourceType, pattern: &str, rights: Rights) -> CapabilityToken {
        caps.issue(CapabilitySpec::new(rt, pattern, rights).owner("mod")).unwrap()
    }

    struct EchoFetcher;

    #[async_trait]
    impl NetworkFetcher for EchoFetcher {
        async fn fetch(&self, url: &str) -> std::result::Result<Value, String> {
            Ok(json!({ "url": url }))
        }
    }

    #[tokio::test]
    async fn test_now_requires_clock_capability() {
        let fx = fixture(Arc::new(DenyNetwork));
        let allowed = [SyscallKind::Now];

        let sys = Syscalls::new("mod", ProcessId(1), &allowed, &[], &fx.host);
        assert!(matches!(sys.now().await, Err(KernelError::Capability(_))));

        let tokens = [issue(&fx.caps, ResourceType::Clock, "*", Rights::read_only())];
        let sys = Syscalls::new("mod", ProcessId(1), &allowed, &tokens, &fx.host);
        assert_eq!(sys.now().await.unwrap(), fx.host.clock().now_millis());
    }

    #[tokio::test]
    async fn test_syscall_must_be_listed() {
        let fx = fixture(Arc::new(DenyNetwork));
        let tokens = [issue(&fx.caps, ResourceType::Storage, "*", Rights::read_write())];
        let sys = Syscalls::new("mod", ProcessId(1), &[SyscallKind::StorageRead], &tokens, &fx.host);

        let err = sys.storage_write("emp-1", json!(1)).await.unwrap_err();
        assert!(matches!(err, KernelError::SyscallNotAllowed { .. }));
        let denied = fx.audit.entries_by_source("syscall");
        assert_eq!(denied.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_scoped_by_pattern() {
        let fx = fixture(Arc::new(DenyNetwork));
        let tokens = [
            issue(&fx.caps, ResourceType::Clock, "*", Rights::read_only()),
            issue(&fx.caps, ResourceType::Storage, "balances.*", Rights::read_write()),
        ];
        let allowed = [SyscallKind::StorageRead, SyscallKind::StorageWrite];
        let sys = Syscalls::new("mod", ProcessId(1), &allowed, &tokens, &fx.host);

        sys.storage_write("balances.emp-1", json!(40)).await.unwrap();
        assert_eq!(sys.storage_read("balances.emp-1").await.unwrap(), Some(json!(40)));
        assert_eq!(sys.storage_read("balances.emp-2").await.unwrap(), None);

        let err = sys.storage_read("payroll.emp-1").await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::Capability(CapabilityError::PatternMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_network_default_denies() {
        let fx = fixture(Arc::new(DenyNetwork));
        let tokens = [issue(&fx.caps, ResourceType::Network, "https://*", Rights::execute_only())];
        let sys = Syscalls::new("mod", ProcessId(1), &[SyscallKind::NetworkFetch], &tokens, &fx.host);
        assert!(matches!(
            sys.fetch("https://example.org").await,
            Err(KernelError::NetworkDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_network_with_host_fetcher() {
        let fx = fixture(Arc::new(EchoFetcher));
        let tokens = [issue(&fx.caps, ResourceType::Network, "https://*", Rights::execute_only())];
        let sys = Syscalls::new("mod", ProcessId(1), &[SyscallKind::NetworkFetch], &tokens, &fx.host);
        let body = sys.fetch("https://example.org").await.unwrap();
        assert_eq!(body["url"], "https://example.org");
    }

    #[tokio::test]
    async fn test_audit_append() {
        let fx = fixture(Arc::new(DenyNetwork));
        let tokens = [issue(&fx.caps, ResourceType::AuditLog, "*", Rights::write_only())];
        let sys = Syscalls::new("mod", ProcessId(1), &[SyscallKind::AuditAppend], &tokens, &fx.host);
        let seq = sys.audit_append("payroll", "batch imported").await.unwrap();
        let entry = fx.audit.range(seq, seq).pop().unwrap();
        assert_eq!(entry.source, "mod");
        assert!(matches!(entry.event, AuditEvent::Custom { .. }));
    }

    #[test]
    fn test_manifest_names() {
        let kinds: Vec<SyscallKind> =
            serde_json::from_str(r#"["now","storageRead","storageWrite","networkFetch","auditAppend"]"#).unwrap();
        assert_eq!(kinds.len(), 5);
        assert_eq!(kinds[3].to_string(), "networkFetch");
    }
}
