//! Dirty-bit flush.
//!
//! Converts the state accumulated during processing into the minimal set
//! of outbound requests, then flushes the transport exactly once. Scratch
//! buffers (root property arrays) come from the tick arena and die with
//! the cycle.

use std::time::Instant;

use tracing::trace;

use crate::core::{Handle, SlotMap};
use crate::transport::{
    ConfigureMask, ConfigureValues, Request, Transport, STACK_MODE_ABOVE, STACK_MODE_BELOW,
};
use crate::wm::client::{ClientCold, ClientHot, DirtyFlags, RootDirty};
use crate::wm::cookies::{CookieFlags, ReplyKind};
use crate::wm::Server;

pub(crate) fn run<T: Transport>(s: &mut Server<T>, now: Instant) {
    let handles: Vec<Handle> = s.clients.live_handles().collect();
    let mut restack_needed = false;

    for &handle in &handles {
        let Some(hot) = s.clients.hot_mut(handle) else {
            continue;
        };
        let dirty = hot.dirty;
        if dirty.is_empty() {
            continue;
        }
        if dirty.contains(DirtyFlags::STACK) {
            restack_needed = true;
        }

        if dirty.contains(DirtyFlags::GEOM) && hot.frame != 0 && hot.desired != hot.server {
            let desired = hot.desired;
            s.transport.submit(Request::ConfigureWindow {
                window: hot.frame,
                mask: ConfigureMask::X
                    | ConfigureMask::Y
                    | ConfigureMask::WIDTH
                    | ConfigureMask::HEIGHT,
                values: ConfigureValues {
                    x: desired.x,
                    y: desired.y,
                    width: desired.w.max(1),
                    height: desired.h.max(1),
                    ..Default::default()
                },
            });
            // The client window tracks the frame's interior size.
            if desired.w != hot.server.w || desired.h != hot.server.h {
                s.transport.submit(Request::ConfigureWindow {
                    window: hot.xid,
                    mask: ConfigureMask::WIDTH | ConfigureMask::HEIGHT,
                    values: ConfigureValues {
                        width: desired.w.max(1),
                        height: desired.h.max(1),
                        ..Default::default()
                    },
                });
            }
            hot.pending = desired;
            s.stats.configures_applied += 1;
        }

        if dirty.contains(DirtyFlags::PROPS) {
            for &atom in hot.changed_atoms.iter() {
                let seq = s.transport.submit(Request::GetProperty {
                    window: hot.xid,
                    property: atom as u32,
                });
                if s.jar.push(
                    seq,
                    ReplyKind::Property { atom: atom as u32 },
                    handle,
                    CookieFlags::empty(),
                    0,
                    now,
                ) {
                    s.stats.cookies_pushed += 1;
                }
            }
            hot.changed_atoms.clear();
        }

        if dirty.contains(DirtyFlags::FRAME) && hot.frame != 0 && hot.frame_damage.valid {
            let damage = hot.frame_damage;
            s.transport.submit(Request::ClearArea {
                window: hot.frame,
                x: damage.x,
                y: damage.y,
                width: damage.w,
                height: damage.h,
            });
            hot.frame_damage.reset();
        }

        hot.dirty = DirtyFlags::empty();
    }

    if restack_needed {
        restack(s);
        s.stats.restacks_applied += 1;
    }

    publish_root(s);

    s.transport.flush();
    s.stats.flushes += 1;
    s.tick_arena.reset();
}

/// Reassert the full stacking order top-down: the topmost frame is raised
/// absolutely, every other frame is placed just below its upper neighbor.
fn restack<T: Transport>(s: &mut Server<T>) {
    let frames: Vec<u32> = s
        .stacking
        .iter_bottom_up()
        .filter_map(|h| s.clients.hot(h))
        .filter(|hot| hot.frame != 0)
        .map(|hot| hot.frame)
        .collect();
    trace!("Restacking {} frames", frames.len());

    let mut above: Option<u32> = None;
    for &frame in frames.iter().rev() {
        let (mask, values) = match above {
            None => (
                ConfigureMask::STACK_MODE,
                ConfigureValues { stack_mode: STACK_MODE_ABOVE, ..Default::default() },
            ),
            Some(sibling) => (
                ConfigureMask::SIBLING | ConfigureMask::STACK_MODE,
                ConfigureValues { sibling, stack_mode: STACK_MODE_BELOW, ..Default::default() },
            ),
        };
        s.transport.submit(Request::ConfigureWindow { window: frame, mask, values });
        above = Some(frame);
    }
}

/// Republish whichever root properties changed this cycle. The arrays are
/// built in the tick arena; the transport serializes them before returning.
fn publish_root<T: Transport>(s: &mut Server<T>) {
    if s.root_dirty.is_empty() {
        return;
    }
    let root = s.transport.root();
    let atoms = *s.transport.atoms();

    if s.root_dirty.contains(RootDirty::CLIENT_LIST) {
        let count = framed_xids(&s.clients).count();
        let values = s.tick_arena.alloc_slice::<u32>(count);
        for (dst, xid) in values.iter_mut().zip(framed_xids(&s.clients)) {
            *dst = xid;
        }
        s.transport.submit(Request::ChangeProperty32 {
            window: root,
            property: atoms.client_list,
            ty: atoms.ty_window,
            values,
        });
    }

    if s.root_dirty.contains(RootDirty::CLIENT_LIST_STACKING) {
        let count = s.stacking.iter_bottom_up().count();
        let values = s.tick_arena.alloc_slice::<u32>(count);
        let mut n = 0;
        for handle in s.stacking.iter_bottom_up() {
            if let Some(hot) = s.clients.hot(handle) {
                values[n] = hot.xid;
                n += 1;
            }
        }
        s.transport.submit(Request::ChangeProperty32 {
            window: root,
            property: atoms.client_list_stacking,
            ty: atoms.ty_window,
            values: &values[..n],
        });
    }

    if s.root_dirty.contains(RootDirty::ACTIVE_WINDOW) {
        let values = s.tick_arena.alloc_slice::<u32>(1);
        values[0] = s.active_window;
        s.transport.submit(Request::ChangeProperty32 {
            window: root,
            property: atoms.active_window,
            ty: atoms.ty_window,
            values,
        });
    }

    if s.root_dirty.contains(RootDirty::WORKAREA) {
        let values = s.tick_arena.alloc_slice::<u32>(4);
        values[0] = s.workarea.x as i32 as u32;
        values[1] = s.workarea.y as i32 as u32;
        values[2] = u32::from(s.workarea.w);
        values[3] = u32::from(s.workarea.h);
        s.transport.submit(Request::ChangeProperty32 {
            window: root,
            property: atoms.workarea,
            ty: atoms.ty_cardinal,
            values,
        });
    }

    s.root_dirty = RootDirty::empty();
}

/// Client window ids of every entity that has a frame, in slot order.
fn framed_xids(clients: &SlotMap<ClientHot, ClientCold>) -> impl Iterator<Item = u32> + '_ {
    clients
        .live_handles()
        .filter_map(move |h| clients.hot(h).filter(|hot| hot.frame != 0).map(|hot| hot.xid))
}
