use stockledger_core::TenantId;

/// Messages that belong to exactly one tenant.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }

    /// Per-tenant channel under `prefix`.
    fn channel(&self, prefix: &str) -> String {
        tenant_channel(prefix, self.tenant_id())
    }
}

/// `<prefix>.<tenant_id>`
pub fn tenant_channel(prefix: &str, tenant_id: TenantId) -> String {
    format!("{prefix}.{tenant_id}")
}
