//! Core types used throughout NOS operating system

/// Process (task) identifier type
pub type Pid = i32;

/// Kernel semaphore identifier
pub type SemId = u32;

/// Kernel message queue identifier
pub type MqId = u32;

/// Watchdog timer identifier
pub type WdogId = u32;

/// Signal number
pub type Signo = i32;

/// Pid value reserved for "no task"
pub const PID_NONE: Pid = -1;

/// Signal raised on a task that subscribed to binary state callbacks
pub const SIGBM: Signo = 30;

/// Opaque interrupt state returned by `enter_critical_section`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub u32);
