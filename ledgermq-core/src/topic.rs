//! Legacy topic name translation.
//!
//! Wire topic strings arrive in several shapes: a bare name, `ns%name`,
//! `tenant|ns%name`, a per-group retry bucket `%RETRY%group`, or a per-group
//! dead-letter bucket `%DLQ%group`. Every shape maps to exactly one backend
//! partitioned-topic family `persistent://tenant/ns/local`, with partitions
//! addressed as `...-partition-<N>`. The reverse mapping strips the domain
//! and partition back off; it is not injective because the backend can also
//! be addressed directly.

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::types::PartitionId;

/// Prefix of per-group retry topics on the wire.
pub const RETRY_TOPIC_PREFIX: &str = "%RETRY%";

/// Prefix of per-group dead-letter topics on the wire.
pub const DLQ_TOPIC_PREFIX: &str = "%DLQ%";

/// Local-name prefix of the scheduled-delivery pseudo-topics, one per delay
/// level.
pub const DELAY_TOPIC_PREFIX: &str = "__delay_level_";

/// Tenant injected when the wire string names none.
pub const DEFAULT_TENANT: &str = "ledgermq";

/// Namespace injected when the wire string names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace hosting system topics (delay pseudo-topics live here).
pub const META_NAMESPACE: &str = "__system";

/// Storage domain prefix of every backend topic.
pub const DOMAIN_PREFIX: &str = "persistent://";

/// Suffix separating a partitioned-topic family from one partition.
pub const PARTITION_SUFFIX: &str = "-partition-";

const TENANT_SEPARATOR: char = '|';
const NAMESPACE_SEPARATOR: char = '%';

/// What role a topic plays in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Ordinary client topic.
    Normal,
    /// `%RETRY%<group>`: per-group redelivery bucket; the local name is the
    /// group name.
    Retry,
    /// `%DLQ%<group>`: per-group terminal bucket; the local name is the
    /// group name.
    Dlq,
    /// Scheduled-delivery pseudo-topic for one delay level.
    Delay(u32),
    /// System topic in the meta namespace.
    Meta,
}

/// A parsed legacy topic and its backend addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTopic {
    tenant: String,
    namespace: String,
    local: String,
    kind: TopicKind,
}

impl LegacyTopic {
    /// Parses a wire topic string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTopic`] for empty names or empty
    /// components (`"ns%"`, `"|ns%x"`).
    pub fn parse(wire: &str) -> CoreResult<Self> {
        Self::parse_with_defaults(wire, DEFAULT_TENANT, DEFAULT_NAMESPACE)
    }

    /// Parses a wire topic string with explicit fallback tenant/namespace.
    ///
    /// # Errors
    ///
    /// Same conditions as [`LegacyTopic::parse`].
    pub fn parse_with_defaults(
        wire: &str,
        default_tenant: &str,
        default_namespace: &str,
    ) -> CoreResult<Self> {
        if wire.is_empty() {
            return Err(CoreError::InvalidTopic("empty topic name".into()));
        }

        let (kind_prefix, rest) = if let Some(rest) = wire.strip_prefix(RETRY_TOPIC_PREFIX) {
            (Some(TopicKind::Retry), rest)
        } else if let Some(rest) = wire.strip_prefix(DLQ_TOPIC_PREFIX) {
            (Some(TopicKind::Dlq), rest)
        } else {
            (None, wire)
        };

        let (tenant, namespace, local) = match rest.split_once(NAMESPACE_SEPARATOR) {
            Some((prefix, local)) => {
                let (tenant, namespace) = match prefix.split_once(TENANT_SEPARATOR) {
                    Some((tenant, namespace)) => (tenant, namespace),
                    None => ("", prefix),
                };
                (tenant, namespace, local)
            }
            None => ("", "", rest),
        };

        if local.is_empty() || (tenant.is_empty() && rest.starts_with(TENANT_SEPARATOR)) {
            return Err(CoreError::InvalidTopic(wire.to_string()));
        }
        if !tenant.is_empty() && namespace.is_empty() {
            return Err(CoreError::InvalidTopic(wire.to_string()));
        }

        let delay_level = local
            .strip_prefix(DELAY_TOPIC_PREFIX)
            .and_then(|level| level.parse::<u32>().ok());

        let namespace = if namespace.is_empty() {
            if delay_level.is_some() {
                META_NAMESPACE
            } else {
                default_namespace
            }
        } else {
            namespace
        };
        let tenant = if tenant.is_empty() { default_tenant } else { tenant };

        let kind = kind_prefix.unwrap_or_else(|| match delay_level {
            Some(level) => TopicKind::Delay(level),
            None if namespace == META_NAMESPACE => TopicKind::Meta,
            None => TopicKind::Normal,
        });

        Ok(Self {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            local: local.to_string(),
            kind,
        })
    }

    /// The wire string for the retry topic of a consumer group.
    #[must_use]
    pub fn retry_topic(group: &str) -> String {
        format!("{RETRY_TOPIC_PREFIX}{group}")
    }

    /// The wire string for the dead-letter topic of a consumer group.
    #[must_use]
    pub fn dlq_topic(group: &str) -> String {
        format!("{DLQ_TOPIC_PREFIX}{group}")
    }

    /// The scheduled-delivery pseudo-topic for a delay level.
    #[must_use]
    pub fn delay_topic(level: u32) -> Self {
        Self {
            tenant: DEFAULT_TENANT.to_string(),
            namespace: META_NAMESPACE.to_string(),
            local: format!("{DELAY_TOPIC_PREFIX}{level}"),
            kind: TopicKind::Delay(level),
        }
    }

    /// Parses a backend topic name (`persistent://tenant/ns/local`, with or
    /// without a partition suffix) back into a legacy topic.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTopic`] if the name does not have the
    /// three-segment backend shape.
    pub fn from_backend(backend: &str) -> CoreResult<Self> {
        let stripped = backend.strip_prefix(DOMAIN_PREFIX).unwrap_or(backend);
        let (base, _) = split_partition(stripped);

        let mut segments = base.splitn(3, '/');
        let (tenant, namespace, local) = match (segments.next(), segments.next(), segments.next()) {
            (Some(t), Some(n), Some(l)) if !t.is_empty() && !n.is_empty() && !l.is_empty() => {
                (t, n, l)
            }
            _ => return Err(CoreError::InvalidTopic(backend.to_string())),
        };

        // The backend local name keeps the retry/DLQ prefix; fold it back
        // into the kind the same way the wire parser does.
        let rebuilt = if namespace == DEFAULT_NAMESPACE && tenant == DEFAULT_TENANT {
            local.to_string()
        } else if tenant == DEFAULT_TENANT {
            format!("{namespace}{NAMESPACE_SEPARATOR}{local}")
        } else {
            format!("{tenant}{TENANT_SEPARATOR}{namespace}{NAMESPACE_SEPARATOR}{local}")
        };
        Self::parse(&rebuilt)
    }

    /// The tenant this topic lives under.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The namespace this topic lives under.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The bare local name (group name for retry/DLQ topics).
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// The topic's protocol role.
    #[must_use]
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// True for `%RETRY%` topics.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self.kind, TopicKind::Retry)
    }

    /// True for `%DLQ%` topics.
    #[must_use]
    pub fn is_dlq(&self) -> bool {
        matches!(self.kind, TopicKind::Dlq)
    }

    /// The local name as the backend sees it (retry/DLQ prefix folded back
    /// in, so each group's buckets stay distinct topic families).
    #[must_use]
    pub fn backend_local(&self) -> String {
        match self.kind {
            TopicKind::Retry => format!("{RETRY_TOPIC_PREFIX}{}", self.local),
            TopicKind::Dlq => format!("{DLQ_TOPIC_PREFIX}{}", self.local),
            _ => self.local.clone(),
        }
    }

    /// Fully-qualified backend topic family name.
    #[must_use]
    pub fn backend_name(&self) -> String {
        format!(
            "{DOMAIN_PREFIX}{}/{}/{}",
            self.tenant,
            self.namespace,
            self.backend_local()
        )
    }

    /// Backend topic family name without the domain prefix.
    #[must_use]
    pub fn no_domain_name(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.namespace, self.backend_local())
    }

    /// Backend name of one partition of this topic.
    #[must_use]
    pub fn partition_name(&self, partition: PartitionId) -> String {
        format!("{}{PARTITION_SUFFIX}{}", self.backend_name(), partition.get())
    }

    /// Reconstructs the wire string, omitting the injected defaults.
    #[must_use]
    pub fn wire_name(&self) -> String {
        let prefix = match self.kind {
            TopicKind::Retry => RETRY_TOPIC_PREFIX,
            TopicKind::Dlq => DLQ_TOPIC_PREFIX,
            _ => "",
        };
        let implied_namespace = match self.kind {
            TopicKind::Delay(_) => META_NAMESPACE,
            _ => DEFAULT_NAMESPACE,
        };
        if self.tenant != DEFAULT_TENANT {
            format!(
                "{prefix}{}{TENANT_SEPARATOR}{}{NAMESPACE_SEPARATOR}{}",
                self.tenant, self.namespace, self.local
            )
        } else if self.namespace != implied_namespace {
            format!(
                "{prefix}{}{NAMESPACE_SEPARATOR}{}",
                self.namespace, self.local
            )
        } else {
            format!("{prefix}{}", self.local)
        }
    }
}

impl fmt::Display for LegacyTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// Splits a backend topic name into its family base and partition index, if
/// the name carries one.
#[must_use]
pub fn split_partition(name: &str) -> (&str, Option<PartitionId>) {
    if let Some(at) = name.rfind(PARTITION_SUFFIX) {
        let index = &name[at + PARTITION_SUFFIX.len()..];
        if let Ok(partition) = index.parse::<u32>() {
            return (&name[..at], Some(PartitionId::new(partition)));
        }
    }
    (name, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_gets_defaults() {
        let topic = LegacyTopic::parse("orders").unwrap();
        assert_eq!(topic.tenant(), DEFAULT_TENANT);
        assert_eq!(topic.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(topic.local_name(), "orders");
        assert_eq!(topic.kind(), TopicKind::Normal);
        assert_eq!(
            topic.backend_name(),
            "persistent://ledgermq/default/orders"
        );
    }

    #[test]
    fn test_namespace_and_tenant_forms() {
        let topic = LegacyTopic::parse("billing%orders").unwrap();
        assert_eq!(topic.namespace(), "billing");
        assert_eq!(topic.tenant(), DEFAULT_TENANT);

        let topic = LegacyTopic::parse("acme|billing%orders").unwrap();
        assert_eq!(topic.tenant(), "acme");
        assert_eq!(topic.namespace(), "billing");
        assert_eq!(topic.local_name(), "orders");
        assert_eq!(
            topic.backend_name(),
            "persistent://acme/billing/orders"
        );
    }

    #[test]
    fn test_retry_and_dlq_topics() {
        let retry = LegacyTopic::parse("%RETRY%pay-group").unwrap();
        assert!(retry.is_retry());
        assert_eq!(retry.local_name(), "pay-group");
        assert_eq!(
            retry.backend_name(),
            "persistent://ledgermq/default/%RETRY%pay-group"
        );

        let dlq = LegacyTopic::parse(&LegacyTopic::dlq_topic("pay-group")).unwrap();
        assert!(dlq.is_dlq());
        assert_eq!(dlq.wire_name(), "%DLQ%pay-group");
    }

    #[test]
    fn test_retry_with_namespace() {
        let retry = LegacyTopic::parse("%RETRY%billing%pay-group").unwrap();
        assert!(retry.is_retry());
        assert_eq!(retry.namespace(), "billing");
        assert_eq!(retry.local_name(), "pay-group");
        assert_eq!(retry.wire_name(), "%RETRY%billing%pay-group");
    }

    #[test]
    fn test_delay_topic() {
        let delay = LegacyTopic::delay_topic(3);
        assert_eq!(delay.kind(), TopicKind::Delay(3));
        assert_eq!(delay.namespace(), META_NAMESPACE);
        assert_eq!(
            delay.backend_name(),
            "persistent://ledgermq/__system/__delay_level_3"
        );
        // And it parses back to the same kind.
        let reparsed = LegacyTopic::parse(&delay.wire_name()).unwrap();
        assert_eq!(reparsed.kind(), TopicKind::Delay(3));
    }

    #[test]
    fn test_partition_name_and_split() {
        let topic = LegacyTopic::parse("orders").unwrap();
        let name = topic.partition_name(PartitionId::new(4));
        assert_eq!(name, "persistent://ledgermq/default/orders-partition-4");

        let (base, partition) = split_partition(&name);
        assert_eq!(base, "persistent://ledgermq/default/orders");
        assert_eq!(partition, Some(PartitionId::new(4)));

        let (base, partition) = split_partition("persistent://a/b/c");
        assert_eq!(base, "persistent://a/b/c");
        assert_eq!(partition, None);
    }

    #[test]
    fn test_backend_round_trip() {
        for wire in [
            "orders",
            "billing%orders",
            "acme|billing%orders",
            "%RETRY%pay-group",
            "%DLQ%pay-group",
        ] {
            let topic = LegacyTopic::parse(wire).unwrap();
            let back = LegacyTopic::from_backend(&topic.backend_name()).unwrap();
            assert_eq!(back.wire_name(), wire, "via {}", topic.backend_name());
        }
    }

    #[test]
    fn test_from_backend_strips_partition() {
        let back =
            LegacyTopic::from_backend("persistent://ledgermq/default/orders-partition-7").unwrap();
        assert_eq!(back.wire_name(), "orders");
    }

    #[test]
    fn test_invalid_names() {
        assert!(LegacyTopic::parse("").is_err());
        assert!(LegacyTopic::parse("ns%").is_err());
        assert!(LegacyTopic::parse("|ns%x").is_err());
        assert!(LegacyTopic::from_backend("persistent://only/two").is_err());
    }
}
