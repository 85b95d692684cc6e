use speedy::{Readable, Writable};

/// Action field of the UDP tracker protocol, BEP 15.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Readable, Writable)]
#[speedy(tag_type = u32)]
pub enum Action {
    Connect = 0,
    #[default]
    Announce = 1,
    Scrape = 2,
    Error = 3,
}
