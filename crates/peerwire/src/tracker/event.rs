use speedy::{Readable, Writable};

/// Event of an announce, the tracker uses it to keep its stats.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Readable, Writable)]
#[speedy(tag_type = u32)]
pub enum Event {
    /// Regular re-announce.
    None = 0,
    Completed = 1,
    #[default]
    Started = 2,
    Stopped = 3,
}
