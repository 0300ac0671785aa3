//! Process runtime: task pool, timers, listeners and the context tying them together.

mod context;
mod event_loop;
mod lock_status;
mod notification;
mod semaphore;
mod task_pool;
mod time_tick;
mod user_change;

pub use context::RuntimeContext;
pub use event_loop::{EventLoop, TimerAction, TimerFinalizer, TimerId};
pub use lock_status::LockStatusObserver;
pub use notification::{EventType, Listener, ListenerAction, NotificationChain};
pub use semaphore::Semaphore;
pub use task_pool::{Task, TaskPool};
pub use time_tick::{TimeOffset, TimeTickMonitor};
pub use user_change::{UserChangeEvent, UserChangeMonitor};
