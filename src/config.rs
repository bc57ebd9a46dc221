//! IPC configuration
//!
//! Tunables for queue limits and name table sizing. A process-wide
//! configuration can be installed once at boot through [`init`]; spaces and
//! ports created afterwards pick it up through [`get`].

use spin::Once;

use crate::ipc::IpcError;

/// Default queue limit (number of messages)
pub const MQUEUE_DEFAULT_LIMIT: usize = 5;

/// Maximum queue limit (MACH_PORT_QLIMIT_MAX)
pub const MQUEUE_MAX_LIMIT: usize = 1024;

/// Initial table size (number of entries)
pub const IPC_ENTRY_TABLE_MIN: usize = 16;

/// Maximum table size
pub const IPC_ENTRY_TABLE_MAX: usize = 65536;

/// Default maximum members of a port set
pub const PSET_DEFAULT_MAX_MEMBERS: usize = 256;

/// IPC subsystem tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    /// Queue limit given to newly allocated ports
    pub default_qlimit: usize,
    /// Upper bound accepted by `port_set_qlimit`
    pub max_qlimit: usize,
    /// Initial number of slots in a space's entry table
    pub table_initial_size: usize,
    /// Number of slots past which allocation fails with `ResourceShortage`
    pub table_max_size: usize,
    /// Maximum number of ports in one port set
    pub pset_max_members: usize,
}

impl IpcConfig {
    pub const fn new() -> Self {
        Self {
            default_qlimit: MQUEUE_DEFAULT_LIMIT,
            max_qlimit: MQUEUE_MAX_LIMIT,
            table_initial_size: IPC_ENTRY_TABLE_MIN,
            table_max_size: IPC_ENTRY_TABLE_MAX,
            pset_max_members: PSET_DEFAULT_MAX_MEMBERS,
        }
    }

    pub const fn with_default_qlimit(mut self, qlimit: usize) -> Self {
        self.default_qlimit = qlimit;
        self
    }

    pub const fn with_max_qlimit(mut self, max: usize) -> Self {
        self.max_qlimit = max;
        self
    }

    pub const fn with_table_size(mut self, initial: usize, max: usize) -> Self {
        self.table_initial_size = initial;
        self.table_max_size = max;
        self
    }

    pub const fn with_pset_max_members(mut self, max: usize) -> Self {
        self.pset_max_members = max;
        self
    }

    /// Check that the limits are consistent with each other
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.default_qlimit > self.max_qlimit {
            return Err(IpcError::InvalidValue);
        }
        // Slot 0 is MACH_PORT_NULL, so a usable table needs at least two slots
        if self.table_initial_size < 2 || self.table_initial_size > self.table_max_size {
            return Err(IpcError::InvalidValue);
        }
        if self.pset_max_members == 0 {
            return Err(IpcError::InvalidValue);
        }
        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self::new()
    }
}

static CONFIG: Once<IpcConfig> = Once::new();

/// Install the process-wide configuration.
///
/// Only the first successful call takes effect; later calls return the
/// configuration already in force.
pub fn init(config: IpcConfig) -> Result<&'static IpcConfig, IpcError> {
    config.validate()?;
    Ok(CONFIG.call_once(|| config))
}

/// Current process-wide configuration (defaults if `init` was never called)
pub fn get() -> IpcConfig {
    CONFIG.get().copied().unwrap_or_default()
}
