//! The consumer side: what slice of the log is on screen, and when it moves.

pub mod periods;
pub mod poller;
pub mod trigger_window;

pub use periods::{find_period, format_period, PERIODS};
pub use poller::ViewPoller;
pub use trigger_window::{
    ChannelState, TriggerMode, TriggerPolarity, TriggerSettings, TriggerWindow, ViewEvent,
    ViewState,
};
