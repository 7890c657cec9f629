//! Protocol transport seam.
//!
//! The event core never touches the X connection directly; it talks to a
//! [`Transport`] that yields tagged events, accepts outbound requests (each
//! assigned a sequence number at submit time), and exposes a non-blocking
//! poll for completed replies. Keeping the seam this narrow is what lets the
//! whole pipeline run against [`mock::MockTransport`] in tests.

pub mod x11;

#[cfg(test)]
pub mod mock;

use bitflags::bitflags;
use thiserror::Error;

pub use x11::X11Transport;

/// Map state reported by a window-attributes reply.
pub const MAP_STATE_UNMAPPED: u8 = 0;
pub const MAP_STATE_VIEWABLE: u8 = 2;

/// Stack modes accepted by configure requests.
pub const STACK_MODE_ABOVE: u8 = 0;
pub const STACK_MODE_BELOW: u8 = 1;

/// ICCCM WM_CHANGE_STATE argument requesting iconification.
pub const WM_STATE_ICONIC: u32 = 3;

/// Event-mask bits for [`Request::SelectInput`], matching the core
/// protocol encoding.
pub const EVENT_STRUCTURE_NOTIFY: u32 = 1 << 17;
pub const EVENT_PROPERTY_CHANGE: u32 = 1 << 22;

bitflags! {
    /// Which configure fields a request carries. Bit values follow the
    /// core protocol's ConfigWindow encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigureMask: u16 {
        const X            = 1 << 0;
        const Y            = 1 << 1;
        const WIDTH        = 1 << 2;
        const HEIGHT       = 1 << 3;
        const BORDER_WIDTH = 1 << 4;
        const SIBLING      = 1 << 5;
        const STACK_MODE   = 1 << 6;
    }
}

/// Field values paired with a [`ConfigureMask`]; unmasked fields are
/// meaningless and stay at their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigureValues {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
    pub sibling: u32,
    pub stack_mode: u8,
}

/// One inbound event, already decoded into plain fields. Kinds the core
/// does not react to are dropped inside the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    CreateNotify { window: u32, override_redirect: bool },
    MapRequest { window: u32 },
    MapNotify { window: u32 },
    UnmapNotify { window: u32 },
    DestroyNotify { window: u32 },
    KeyPress { keycode: u8, state: u16 },
    Button { window: u32, detail: u8, state: u16, root_x: i16, root_y: i16, pressed: bool },
    ClientMessage { window: u32, message_type: u32, format: u8, data: [u32; 5] },
    ConfigureRequest { window: u32, mask: ConfigureMask, values: ConfigureValues },
    ConfigureNotify { window: u32, x: i16, y: i16, width: u16, height: u16 },
    PropertyNotify { window: u32, atom: u32, deleted: bool },
    Motion { window: u32, root_x: i16, root_y: i16, state: u16 },
    Enter { window: u32, root_x: i16, root_y: i16 },
    Leave { window: u32 },
    Expose { window: u32, x: u16, y: u16, width: u16, height: u16 },
    Damage { drawable: u32, x: i16, y: i16, width: u16, height: u16 },
    ColormapNotify { window: u32, colormap: u32, installed: bool },
    ScreenChange { width: u16, height: u16 },
}

/// One outbound request. Borrowed slices (property values) point into the
/// tick arena and are serialized before `submit` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    ConfigureWindow { window: u32, mask: ConfigureMask, values: ConfigureValues },
    MapWindow { window: u32 },
    UnmapWindow { window: u32 },
    CreateFrame { frame: u32, parent: u32, x: i16, y: i16, width: u16, height: u16, border_width: u16 },
    DestroyWindow { window: u32 },
    ReparentWindow { window: u32, parent: u32, x: i16, y: i16 },
    SelectInput { window: u32, mask: u32 },
    ChangeProperty32 { window: u32, property: u32, ty: u32, values: &'a [u32] },
    ClearArea { window: u32, x: i16, y: i16, width: u16, height: u16 },
    // Async queries; the caller registers a cookie for the returned sequence.
    GetWindowAttributes { window: u32 },
    GetGeometry { drawable: u32 },
    GetProperty { window: u32, property: u32 },
    QueryPointer { window: u32 },
    QueryTree { window: u32 },
}

/// A completed query reply, length-checked and decoded by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    WindowAttributes { override_redirect: bool, map_state: u8, colormap: u32 },
    Geometry { x: i16, y: i16, width: u16, height: u16, border_width: u16, depth: u8 },
    Property { format: u8, ty: u32, data: Vec<u8> },
    Pointer { root_x: i16, root_y: i16, child: u32 },
    Tree { children: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("request failed with protocol error code {code}")]
    Protocol { code: u8 },
    #[error("reply body was truncated or malformed")]
    Malformed,
    #[error("no reply arrived before the cookie timeout")]
    TimedOut,
    #[error("connection to the display server was lost")]
    ConnectionLost,
}

/// Atoms the core publishes root properties under, resolved once at
/// startup. The core treats them as opaque tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct Atoms {
    pub client_list: u32,
    pub client_list_stacking: u32,
    pub active_window: u32,
    pub workarea: u32,
    pub wm_change_state: u32,
    pub ty_window: u32,
    pub ty_cardinal: u32,
}

pub trait Transport {
    /// Non-blocking pull of the next buffered event.
    fn poll_event(&mut self) -> Option<RawEvent>;

    /// Issue a request; returns its sequence number. Sequence numbers are
    /// unique and monotonically increasing for the life of the connection.
    fn submit(&mut self, req: Request<'_>) -> u64;

    /// Non-blocking pull of the next completed reply or error.
    fn poll_reply(&mut self) -> Option<(u64, Result<Reply, ReplyError>)>;

    /// Push all buffered outbound requests to the server.
    fn flush(&mut self);

    /// Allocate a fresh resource id (frame windows).
    fn generate_id(&mut self) -> u32;

    fn atoms(&self) -> &Atoms;

    /// Root window of the managed screen.
    fn root(&self) -> u32;

    /// Current screen dimensions in pixels.
    fn screen_size(&self) -> (u16, u16);

    /// Readable fd of the underlying connection, when there is one.
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd>;

    /// False once the connection has failed; the loop exits on this.
    fn healthy(&self) -> bool;
}
