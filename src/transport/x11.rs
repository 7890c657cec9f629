//! x11rb-backed transport.
//!
//! Owns the `RustConnection`, decodes inbound events into [`RawEvent`], and
//! correlates query replies by sequence number. x11rb's synchronous API has
//! no per-sequence non-blocking reply poll, so the transport tracks which
//! sequences have been flushed to the server and resolves a pending query
//! only once its sequence is at or below the flush watermark; by the time
//! the next cycle drains replies, those have arrived.

use std::collections::VecDeque;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use tracing::{debug, error, info};
use x11rb::connection::{Connection, ReplyOrError, RequestConnection};
use x11rb::errors::ConnectionError;
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ColormapState, ConfigureWindowAux,
    ConnectionExt, CreateWindowAux, EventMask, GetGeometryReply,
    GetPropertyReply, GetWindowAttributesReply, PropMode, Property,
    QueryPointerReply, QueryTreeReply, StackMode, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::x11_utils::TryParse;

use super::{
    Atoms, ConfigureMask, ConfigureValues, RawEvent, Reply, ReplyError,
    Request, Transport,
};

/// Longest property we fetch, in 32-bit words.
const PROPERTY_FETCH_WORDS: u32 = 1024;

#[derive(Debug, Clone, Copy)]
enum QueryKind {
    Attributes,
    Geometry,
    Property,
    Pointer,
    Tree,
}

pub struct X11Transport {
    conn: RustConnection,
    root: u32,
    screen_width: u16,
    screen_height: u16,
    atoms: Atoms,
    /// Queries awaiting resolution, in issue order.
    pending: VecDeque<(u64, QueryKind)>,
    last_seq: u64,
    flushed_seq: u64,
    broken: bool,
}

impl X11Transport {
    /// Connect to the display, claim substructure redirection on the root,
    /// and resolve the atoms the core publishes under.
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) = RustConnection::connect(display)
            .context("Failed to connect to X server")?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let screen_width = screen.width_in_pixels;
        let screen_height = screen.height_in_pixels;
        info!(
            "Connected to display, screen {} root 0x{:x} ({}x{})",
            screen_num, root, screen_width, screen_height
        );

        let root_mask = EventMask::SUBSTRUCTURE_REDIRECT
            | EventMask::SUBSTRUCTURE_NOTIFY
            | EventMask::BUTTON_PRESS
            | EventMask::BUTTON_RELEASE
            | EventMask::POINTER_MOTION
            | EventMask::ENTER_WINDOW
            | EventMask::LEAVE_WINDOW
            | EventMask::PROPERTY_CHANGE
            | EventMask::KEY_PRESS;
        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(root_mask),
        )?
        .check()
        .context("Failed to select events on root window - is another WM running?")?;

        let atoms = Atoms {
            client_list: intern(&conn, "_NET_CLIENT_LIST")?,
            client_list_stacking: intern(&conn, "_NET_CLIENT_LIST_STACKING")?,
            active_window: intern(&conn, "_NET_ACTIVE_WINDOW")?,
            workarea: intern(&conn, "_NET_WORKAREA")?,
            wm_change_state: intern(&conn, "WM_CHANGE_STATE")?,
            ty_window: u32::from(AtomEnum::WINDOW),
            ty_cardinal: u32::from(AtomEnum::CARDINAL),
        };
        conn.flush().context("Failed to flush connection setup")?;

        Ok(Self {
            conn,
            root,
            screen_width,
            screen_height,
            atoms,
            pending: VecDeque::new(),
            last_seq: 0,
            flushed_seq: 0,
            broken: false,
        })
    }

    fn mark_broken(&mut self, err: &ConnectionError) {
        if !self.broken {
            error!("X connection failed: {}", err);
        }
        self.broken = true;
    }

    fn submit_inner(&mut self, req: &Request<'_>) -> Result<u64, ConnectionError> {
        let seq = match req {
            Request::ConfigureWindow { window, mask, values } => {
                let aux = configure_aux(*mask, *values);
                self.conn.configure_window(*window, &aux)?.sequence_number()
            }
            Request::MapWindow { window } => {
                self.conn.map_window(*window)?.sequence_number()
            }
            Request::UnmapWindow { window } => {
                self.conn.unmap_window(*window)?.sequence_number()
            }
            Request::CreateFrame { frame, parent, x, y, width, height, border_width } => {
                self.conn
                    .create_window(
                        x11rb::COPY_DEPTH_FROM_PARENT,
                        *frame,
                        *parent,
                        *x,
                        *y,
                        *width,
                        *height,
                        *border_width,
                        WindowClass::INPUT_OUTPUT,
                        0,
                        &CreateWindowAux::new().event_mask(
                            EventMask::SUBSTRUCTURE_NOTIFY
                                | EventMask::ENTER_WINDOW
                                | EventMask::LEAVE_WINDOW
                                | EventMask::EXPOSURE,
                        ),
                    )?
                    .sequence_number()
            }
            Request::DestroyWindow { window } => {
                self.conn.destroy_window(*window)?.sequence_number()
            }
            Request::ReparentWindow { window, parent, x, y } => {
                self.conn.reparent_window(*window, *parent, *x, *y)?.sequence_number()
            }
            Request::SelectInput { window, mask } => {
                self.conn
                    .change_window_attributes(
                        *window,
                        &ChangeWindowAttributesAux::new().event_mask(EventMask::from(*mask)),
                    )?
                    .sequence_number()
            }
            Request::ChangeProperty32 { window, property, ty, values } => {
                self.conn
                    .change_property32(PropMode::REPLACE, *window, *property, *ty, values)?
                    .sequence_number()
            }
            Request::ClearArea { window, x, y, width, height } => {
                self.conn.clear_area(true, *window, *x, *y, *width, *height)?.sequence_number()
            }
            Request::GetWindowAttributes { window } => {
                let cookie = self.conn.get_window_attributes(*window)?;
                detach(&mut self.pending, QueryKind::Attributes, cookie.sequence_number(), cookie)
            }
            Request::GetGeometry { drawable } => {
                let cookie = self.conn.get_geometry(*drawable)?;
                detach(&mut self.pending, QueryKind::Geometry, cookie.sequence_number(), cookie)
            }
            Request::GetProperty { window, property } => {
                let cookie = self.conn.get_property(
                    false,
                    *window,
                    *property,
                    AtomEnum::ANY,
                    0,
                    PROPERTY_FETCH_WORDS,
                )?;
                detach(&mut self.pending, QueryKind::Property, cookie.sequence_number(), cookie)
            }
            Request::QueryPointer { window } => {
                let cookie = self.conn.query_pointer(*window)?;
                detach(&mut self.pending, QueryKind::Pointer, cookie.sequence_number(), cookie)
            }
            Request::QueryTree { window } => {
                let cookie = self.conn.query_tree(*window)?;
                detach(&mut self.pending, QueryKind::Tree, cookie.sequence_number(), cookie)
            }
        };
        Ok(seq)
    }
}

/// Record a pending query and detach its typed cookie. Dropping the cookie
/// would tell x11rb to discard the reply; the raw bytes are fetched later
/// by sequence number instead.
fn detach<T>(
    pending: &mut VecDeque<(u64, QueryKind)>,
    kind: QueryKind,
    seq: u64,
    cookie: T,
) -> u64 {
    mem::forget(cookie);
    pending.push_back((seq, kind));
    seq
}

impl Transport for X11Transport {
    fn poll_event(&mut self) -> Option<RawEvent> {
        if self.broken {
            return None;
        }
        loop {
            match self.conn.poll_for_event() {
                Ok(Some(event)) => {
                    if let Some(raw) = convert_event(event) {
                        return Some(raw);
                    }
                    // Kind we don't ingest; keep draining.
                }
                Ok(None) => return None,
                Err(err) => {
                    self.mark_broken(&err);
                    return None;
                }
            }
        }
    }

    fn submit(&mut self, req: Request<'_>) -> u64 {
        if self.broken {
            return 0;
        }
        match self.submit_inner(&req) {
            Ok(seq) => {
                self.last_seq = seq;
                seq
            }
            Err(err) => {
                self.mark_broken(&err);
                0
            }
        }
    }

    fn poll_reply(&mut self) -> Option<(u64, Result<Reply, ReplyError>)> {
        if self.broken {
            return None;
        }
        let &(seq, kind) = self.pending.front()?;
        if seq > self.flushed_seq {
            return None;
        }
        self.pending.pop_front();
        // The sequence is at or below the flush watermark, so the reply has
        // normally already arrived; at worst this wait is bounded by one
        // server round trip, never an indefinite block.
        let result = match self.conn.wait_for_reply_or_raw_error(seq) {
            Ok(ReplyOrError::Reply(bytes)) => decode_reply(kind, &bytes),
            Ok(ReplyOrError::Error(bytes)) => {
                let code = bytes.get(1).copied().unwrap_or(0);
                Err(ReplyError::Protocol { code })
            }
            Err(err) => {
                self.mark_broken(&err);
                Err(ReplyError::ConnectionLost)
            }
        };
        Some((seq, result))
    }

    fn flush(&mut self) {
        if self.broken {
            return;
        }
        if let Err(err) = self.conn.flush() {
            self.mark_broken(&err);
            return;
        }
        self.flushed_seq = self.last_seq;
    }

    fn generate_id(&mut self) -> u32 {
        match self.conn.generate_id() {
            Ok(id) => id,
            Err(err) => {
                if !self.broken {
                    error!("X id allocation failed: {}", err);
                }
                self.broken = true;
                0
            }
        }
    }

    fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    fn root(&self) -> u32 {
        self.root
    }

    fn screen_size(&self) -> (u16, u16) {
        (self.screen_width, self.screen_height)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.conn.stream().as_raw_fd())
    }

    fn healthy(&self) -> bool {
        !self.broken
    }
}

fn intern(conn: &RustConnection, name: &str) -> Result<u32> {
    Ok(conn
        .intern_atom(false, name.as_bytes())?
        .reply()
        .with_context(|| format!("Failed to intern atom {}", name))?
        .atom)
}

fn configure_aux(mask: ConfigureMask, v: ConfigureValues) -> ConfigureWindowAux {
    let mut aux = ConfigureWindowAux::new();
    if mask.contains(ConfigureMask::X) {
        aux = aux.x(i32::from(v.x));
    }
    if mask.contains(ConfigureMask::Y) {
        aux = aux.y(i32::from(v.y));
    }
    if mask.contains(ConfigureMask::WIDTH) {
        aux = aux.width(u32::from(v.width));
    }
    if mask.contains(ConfigureMask::HEIGHT) {
        aux = aux.height(u32::from(v.height));
    }
    if mask.contains(ConfigureMask::BORDER_WIDTH) {
        aux = aux.border_width(u32::from(v.border_width));
    }
    if mask.contains(ConfigureMask::SIBLING) {
        aux = aux.sibling(v.sibling);
    }
    if mask.contains(ConfigureMask::STACK_MODE) {
        aux = aux.stack_mode(StackMode::from(v.stack_mode));
    }
    aux
}

fn decode_reply(kind: QueryKind, bytes: &[u8]) -> Result<Reply, ReplyError> {
    match kind {
        QueryKind::Attributes => {
            let (r, _) = GetWindowAttributesReply::try_parse(bytes)
                .map_err(|_| ReplyError::Malformed)?;
            Ok(Reply::WindowAttributes {
                override_redirect: r.override_redirect,
                map_state: u8::from(r.map_state),
                colormap: r.colormap,
            })
        }
        QueryKind::Geometry => {
            let (r, _) =
                GetGeometryReply::try_parse(bytes).map_err(|_| ReplyError::Malformed)?;
            Ok(Reply::Geometry {
                x: r.x,
                y: r.y,
                width: r.width,
                height: r.height,
                border_width: r.border_width,
                depth: r.depth,
            })
        }
        QueryKind::Property => {
            let (r, _) =
                GetPropertyReply::try_parse(bytes).map_err(|_| ReplyError::Malformed)?;
            Ok(Reply::Property {
                format: r.format,
                ty: r.type_,
                data: r.value,
            })
        }
        QueryKind::Pointer => {
            let (r, _) =
                QueryPointerReply::try_parse(bytes).map_err(|_| ReplyError::Malformed)?;
            Ok(Reply::Pointer {
                root_x: r.root_x,
                root_y: r.root_y,
                child: r.child,
            })
        }
        QueryKind::Tree => {
            let (r, _) =
                QueryTreeReply::try_parse(bytes).map_err(|_| ReplyError::Malformed)?;
            Ok(Reply::Tree { children: r.children })
        }
    }
}

fn convert_event(event: Event) -> Option<RawEvent> {
    match event {
        Event::CreateNotify(e) => Some(RawEvent::CreateNotify {
            window: e.window,
            override_redirect: e.override_redirect,
        }),
        Event::MapRequest(e) => Some(RawEvent::MapRequest { window: e.window }),
        Event::MapNotify(e) => Some(RawEvent::MapNotify { window: e.window }),
        Event::UnmapNotify(e) => Some(RawEvent::UnmapNotify { window: e.window }),
        Event::DestroyNotify(e) => Some(RawEvent::DestroyNotify { window: e.window }),
        Event::KeyPress(e) => Some(RawEvent::KeyPress {
            keycode: e.detail,
            state: u16::from(e.state),
        }),
        Event::ButtonPress(e) => Some(RawEvent::Button {
            window: e.event,
            detail: e.detail,
            state: u16::from(e.state),
            root_x: e.root_x,
            root_y: e.root_y,
            pressed: true,
        }),
        Event::ButtonRelease(e) => Some(RawEvent::Button {
            window: e.event,
            detail: e.detail,
            state: u16::from(e.state),
            root_x: e.root_x,
            root_y: e.root_y,
            pressed: false,
        }),
        Event::ClientMessage(e) => Some(RawEvent::ClientMessage {
            window: e.window,
            message_type: e.type_,
            format: e.format,
            data: e.data.as_data32(),
        }),
        Event::ConfigureRequest(e) => Some(RawEvent::ConfigureRequest {
            window: e.window,
            mask: ConfigureMask::from_bits_truncate(u16::from(e.value_mask)),
            values: ConfigureValues {
                x: e.x,
                y: e.y,
                width: e.width,
                height: e.height,
                border_width: e.border_width,
                sibling: e.sibling,
                stack_mode: u32::from(e.stack_mode) as u8,
            },
        }),
        Event::ConfigureNotify(e) => Some(RawEvent::ConfigureNotify {
            window: e.window,
            x: e.x,
            y: e.y,
            width: e.width,
            height: e.height,
        }),
        Event::PropertyNotify(e) => Some(RawEvent::PropertyNotify {
            window: e.window,
            atom: e.atom,
            deleted: e.state == Property::DELETE,
        }),
        Event::MotionNotify(e) => Some(RawEvent::Motion {
            window: e.event,
            root_x: e.root_x,
            root_y: e.root_y,
            state: u16::from(e.state),
        }),
        Event::EnterNotify(e) => Some(RawEvent::Enter {
            window: e.event,
            root_x: e.root_x,
            root_y: e.root_y,
        }),
        Event::LeaveNotify(e) => Some(RawEvent::Leave { window: e.event }),
        Event::Expose(e) => Some(RawEvent::Expose {
            window: e.window,
            x: e.x,
            y: e.y,
            width: e.width,
            height: e.height,
        }),
        Event::DamageNotify(e) => Some(RawEvent::Damage {
            drawable: e.drawable,
            x: e.area.x,
            y: e.area.y,
            width: e.area.width,
            height: e.area.height,
        }),
        Event::ColormapNotify(e) => Some(RawEvent::ColormapNotify {
            window: e.window,
            colormap: e.colormap,
            installed: e.state == ColormapState::INSTALLED,
        }),
        Event::RandrScreenChangeNotify(e) => Some(RawEvent::ScreenChange {
            width: e.width,
            height: e.height,
        }),
        Event::Error(e) => {
            debug!("Async protocol error: code {} sequence {}", e.error_code, e.sequence);
            None
        }
        _ => None,
    }
}
