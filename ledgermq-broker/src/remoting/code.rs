//! Request and response codes, and the pull sys-flag bits.

/// Request codes the broker serves.
pub mod request {
    /// Produce one message.
    pub const SEND_MESSAGE: i32 = 10;
    /// Pull a batch of messages.
    pub const PULL_MESSAGE: i32 = 11;
    /// Consumer heartbeat carrying group/subscription state.
    pub const HEART_BEAT: i32 = 34;
    /// Client is going away.
    pub const UNREGISTER_CLIENT: i32 = 35;
    /// Return a message the consumer failed to process.
    pub const CONSUMER_SEND_MSG_BACK: i32 = 36;
    /// Topic route lookup.
    pub const GET_ROUTEINFO_BY_TOPIC: i32 = 105;
    /// Cluster membership lookup.
    pub const GET_BROKER_CLUSTER_INFO: i32 = 106;
    /// Produce one message, compact header form.
    pub const SEND_MESSAGE_V2: i32 = 310;
    /// Produce a batch.
    pub const SEND_BATCH_MESSAGE: i32 = 320;
}

/// Response codes.
pub mod response {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    pub const SYSTEM_BUSY: i32 = 2;
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
    pub const FLUSH_DISK_TIMEOUT: i32 = 10;
    pub const SLAVE_NOT_AVAILABLE: i32 = 11;
    pub const FLUSH_SLAVE_TIMEOUT: i32 = 12;
    pub const MESSAGE_ILLEGAL: i32 = 13;
    pub const SERVICE_NOT_AVAILABLE: i32 = 14;
    pub const NO_PERMISSION: i32 = 16;
    pub const TOPIC_NOT_EXIST: i32 = 17;
    pub const PULL_NOT_FOUND: i32 = 19;
    pub const PULL_RETRY_IMMEDIATELY: i32 = 20;
    pub const PULL_OFFSET_MOVED: i32 = 21;
    pub const SUBSCRIPTION_PARSE_FAILED: i32 = 23;
    pub const SUBSCRIPTION_NOT_EXIST: i32 = 24;
    pub const SUBSCRIPTION_NOT_LATEST: i32 = 25;
    pub const SUBSCRIPTION_GROUP_NOT_EXIST: i32 = 26;
}

/// Bits of the pull request sys-flag.
pub mod pull_flag {
    /// The pull also commits the offset carried in the header.
    pub const COMMIT_OFFSET: i32 = 1;
    /// The broker may hold the pull when nothing is available.
    pub const SUSPEND: i32 = 1 << 1;
    /// The header carries an inline subscription expression.
    pub const SUBSCRIPTION: i32 = 1 << 2;
    /// Class filtering (not supported; present for flag completeness).
    pub const CLASS_FILTER: i32 = 1 << 3;

    /// True if the commit-offset bit is set.
    #[must_use]
    pub const fn has_commit_offset(sys_flag: i32) -> bool {
        sys_flag & COMMIT_OFFSET != 0
    }

    /// True if the suspend bit is set.
    #[must_use]
    pub const fn has_suspend(sys_flag: i32) -> bool {
        sys_flag & SUSPEND != 0
    }

    /// True if the inline-subscription bit is set.
    #[must_use]
    pub const fn has_subscription(sys_flag: i32) -> bool {
        sys_flag & SUBSCRIPTION != 0
    }
}

/// Broker permission bits (shared by broker-wide and per-topic permissions).
pub mod perm {
    pub const READ: u32 = 1 << 2;
    pub const WRITE: u32 = 1 << 1;
    pub const INHERIT: u32 = 1;

    /// True when the permission allows reads.
    #[must_use]
    pub const fn is_readable(permission: u32) -> bool {
        permission & READ != 0
    }

    /// True when the permission allows writes.
    #[must_use]
    pub const fn is_writeable(permission: u32) -> bool {
        permission & WRITE != 0
    }
}

/// Master broker id advertised in pull responses.
pub const MASTER_ID: u64 = 0;
