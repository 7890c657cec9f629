//! Scripted transport for driving the pipeline in tests. Events and
//! replies are queued up front, requests are recorded with the sequence
//! they were assigned.

use std::collections::VecDeque;

use super::{Atoms, ConfigureMask, ConfigureValues, RawEvent, Reply, ReplyError, Request, Transport};

/// Owned mirror of [`Request`], recorded after arena-backed slices have
/// been copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedRequest {
    ConfigureWindow { window: u32, mask: ConfigureMask, values: ConfigureValues },
    MapWindow { window: u32 },
    UnmapWindow { window: u32 },
    CreateFrame { frame: u32, parent: u32, x: i16, y: i16, width: u16, height: u16, border_width: u16 },
    DestroyWindow { window: u32 },
    ReparentWindow { window: u32, parent: u32, x: i16, y: i16 },
    SelectInput { window: u32, mask: u32 },
    ChangeProperty32 { window: u32, property: u32, ty: u32, values: Vec<u32> },
    ClearArea { window: u32, x: i16, y: i16, width: u16, height: u16 },
    GetWindowAttributes { window: u32 },
    GetGeometry { drawable: u32 },
    GetProperty { window: u32, property: u32 },
    QueryPointer { window: u32 },
    QueryTree { window: u32 },
}

impl OwnedRequest {
    fn from_request(req: &Request<'_>) -> Self {
        match *req {
            Request::ConfigureWindow { window, mask, values } => {
                OwnedRequest::ConfigureWindow { window, mask, values }
            }
            Request::MapWindow { window } => OwnedRequest::MapWindow { window },
            Request::UnmapWindow { window } => OwnedRequest::UnmapWindow { window },
            Request::CreateFrame { frame, parent, x, y, width, height, border_width } => {
                OwnedRequest::CreateFrame { frame, parent, x, y, width, height, border_width }
            }
            Request::DestroyWindow { window } => OwnedRequest::DestroyWindow { window },
            Request::ReparentWindow { window, parent, x, y } => {
                OwnedRequest::ReparentWindow { window, parent, x, y }
            }
            Request::SelectInput { window, mask } => OwnedRequest::SelectInput { window, mask },
            Request::ChangeProperty32 { window, property, ty, values } => {
                OwnedRequest::ChangeProperty32 { window, property, ty, values: values.to_vec() }
            }
            Request::ClearArea { window, x, y, width, height } => {
                OwnedRequest::ClearArea { window, x, y, width, height }
            }
            Request::GetWindowAttributes { window } => {
                OwnedRequest::GetWindowAttributes { window }
            }
            Request::GetGeometry { drawable } => OwnedRequest::GetGeometry { drawable },
            Request::GetProperty { window, property } => {
                OwnedRequest::GetProperty { window, property }
            }
            Request::QueryPointer { window } => OwnedRequest::QueryPointer { window },
            Request::QueryTree { window } => OwnedRequest::QueryTree { window },
        }
    }
}

pub struct MockTransport {
    pub events: VecDeque<RawEvent>,
    pub requests: Vec<(u64, OwnedRequest)>,
    pub replies: VecDeque<(u64, Result<Reply, ReplyError>)>,
    pub flush_count: u32,
    next_seq: u64,
    next_id: u32,
    atoms: Atoms,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            events: VecDeque::new(),
            requests: Vec::new(),
            replies: VecDeque::new(),
            flush_count: 0,
            next_seq: 0,
            next_id: 0x0080_0000,
            atoms: Atoms {
                client_list: 901,
                client_list_stacking: 902,
                active_window: 903,
                workarea: 904,
                wm_change_state: 905,
                ty_window: 33,
                ty_cardinal: 6,
            },
        }
    }

    pub fn push_event(&mut self, event: RawEvent) {
        self.events.push_back(event);
    }

    pub fn script_reply(&mut self, seq: u64, reply: Result<Reply, ReplyError>) {
        self.replies.push_back((seq, reply));
    }

    /// Sequence assigned to the most recent request.
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn take_requests(&mut self) -> Vec<(u64, OwnedRequest)> {
        std::mem::take(&mut self.requests)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn poll_event(&mut self) -> Option<RawEvent> {
        self.events.pop_front()
    }

    fn submit(&mut self, req: Request<'_>) -> u64 {
        self.next_seq += 1;
        self.requests.push((self.next_seq, OwnedRequest::from_request(&req)));
        self.next_seq
    }

    fn poll_reply(&mut self) -> Option<(u64, Result<Reply, ReplyError>)> {
        self.replies.pop_front()
    }

    fn flush(&mut self) {
        self.flush_count += 1;
    }

    fn generate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    fn root(&self) -> u32 {
        1
    }

    fn screen_size(&self) -> (u16, u16) {
        (1920, 1080)
    }

    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }

    fn healthy(&self) -> bool {
        true
    }
}
