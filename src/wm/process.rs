//! Reply dispatch and bucket processing.
//!
//! `drain_replies` runs before processing so that query results issued in
//! earlier cycles are visible to this cycle's decisions. `run` then walks
//! the buckets in a fixed stage order: lifecycle first, so every later
//! stage sees a settled entity store, then input, then geometry, then
//! bookkeeping.

use std::mem;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::core::Handle;
use crate::transport::{
    ConfigureMask, Reply, ReplyError, Request, Transport, EVENT_PROPERTY_CHANGE,
    EVENT_STRUCTURE_NOTIFY, MAP_STATE_UNMAPPED, MAP_STATE_VIEWABLE, STACK_MODE_ABOVE,
    WM_STATE_ICONIC,
};
use crate::wm::buckets::{ButtonEvent, MotionEvent, PendingGeometry};
use crate::wm::client::{ClientState, DirtyFlags, Rect, RootDirty};
use crate::wm::cookies::{CookieFlags, CookieSlot, ReplyKind};
use crate::wm::{Interaction, InteractionKind, Server};

/// Upper bound on cookies expired per cycle, so a mass timeout cannot
/// stall a cycle.
const EXPIRY_BUDGET: usize = 64;

/// Pull completed replies off the transport, bounded per cycle, and route
/// each through the jar. Then expire cookies that outlived the timeout,
/// delivering them as errors so owners can unwind.
pub(crate) fn drain_replies<T: Transport>(s: &mut Server<T>, now: Instant) {
    let max = s.config.limits.max_replies_per_cycle;
    let mut drained = 0;
    while drained < max {
        let Some((sequence, result)) = s.transport.poll_reply() else {
            break;
        };
        drained += 1;
        match s.jar.take(sequence) {
            Some(slot) => dispatch(s, slot, result, now),
            None => {
                s.stats.replies_unmatched += 1;
                debug!("Reply for unknown sequence {}, dropping", sequence);
            }
        }
    }
    if drained == max {
        // More replies may be waiting; the next wait must not block.
        s.poll_again = true;
    }

    let timeout = s.config.cookie_timeout();
    for slot in s.jar.expire(now, timeout, EXPIRY_BUDGET) {
        s.stats.cookies_timed_out += 1;
        warn!(
            "Query {} ({:?}) unanswered after {:?}, expiring",
            slot.sequence, slot.kind, timeout
        );
        dispatch(s, slot, Err(ReplyError::TimedOut), now);
    }
}

fn dispatch<T: Transport>(
    s: &mut Server<T>,
    slot: CookieSlot,
    result: Result<Reply, ReplyError>,
    now: Instant,
) {
    if slot.owner.is_invalid() {
        dispatch_unowned(s, slot, result, now);
        return;
    }
    if !s.clients.is_live(slot.owner) {
        s.stats.cookies_stale_dropped += 1;
        debug!(
            "Reply {} ({:?}) addressed a freed entity, dropping",
            slot.sequence, slot.kind
        );
        return;
    }
    s.stats.cookies_dispatched += 1;
    apply_reply(s, slot, result);
}

/// Adoption replies have no owning entity; the entity only comes into
/// being if the probe qualifies the window.
fn dispatch_unowned<T: Transport>(
    s: &mut Server<T>,
    slot: CookieSlot,
    result: Result<Reply, ReplyError>,
    now: Instant,
) {
    match (slot.kind, result) {
        (ReplyKind::AdoptionScan, Ok(Reply::Tree { children })) => {
            debug!("Probing {} pre-existing windows", children.len());
            for child in children {
                let seq = s.transport.submit(Request::GetWindowAttributes { window: child });
                if s.jar.push(
                    seq,
                    ReplyKind::AdoptionProbe { window: child },
                    Handle::INVALID,
                    CookieFlags::empty(),
                    0,
                    now,
                ) {
                    s.stats.cookies_pushed += 1;
                }
            }
        }
        (ReplyKind::AdoptionProbe { window }, Ok(Reply::WindowAttributes { override_redirect, map_state, .. })) => {
            if !override_redirect && map_state == MAP_STATE_VIEWABLE {
                info!("Adopting existing window {}", window);
                manage_start(s, window, map_state, now);
            }
        }
        (kind, Err(err)) => debug!("Unowned query {:?} failed: {}", kind, err),
        (kind, Ok(_)) => warn!("Unowned query {:?} got a mismatched reply shape", kind),
    }
}

fn apply_reply<T: Transport>(s: &mut Server<T>, slot: CookieSlot, result: Result<Reply, ReplyError>) {
    let handle = slot.owner;
    match (slot.kind, result) {
        (ReplyKind::WindowAttributes, Ok(Reply::WindowAttributes { override_redirect, map_state, colormap })) => {
            if let Some((hot, cold)) = s.clients.pair_mut(handle) {
                hot.override_redirect = override_redirect;
                hot.colormap = colormap;
                cold.map_state_at_adopt = map_state;
                if override_redirect && hot.state == ClientState::New {
                    debug!("Window {} is override-redirect, will not manage", hot.xid);
                    hot.manage_aborted = true;
                }
            }
        }
        (ReplyKind::Geometry, Ok(Reply::Geometry { x, y, width, height, .. })) => {
            if let Some(hot) = s.clients.hot_mut(handle) {
                hot.server = Rect::new(x, y, width, height);
                if hot.state == ClientState::New {
                    hot.desired = hot.server;
                }
            }
        }
        (ReplyKind::Property { atom }, Ok(Reply::Property { format, ty, data })) => {
            if let Some((hot, cold)) = s.clients.pair_mut(handle) {
                let value = crate::wm::client::PropertyValue { format, ty, data };
                if cold.properties.get(u64::from(atom)) != Some(&value) {
                    cold.properties.insert(u64::from(atom), value);
                    hot.dirty |= DirtyFlags::FRAME;
                }
            }
        }
        (ReplyKind::Pointer, Ok(Reply::Pointer { root_x, root_y, .. })) => {
            if slot.txn_id != s.txn_id {
                debug!(
                    "Pointer reply for superseded interaction {} (now {})",
                    slot.txn_id, s.txn_id
                );
            } else {
                if let Some(interaction) = s.interaction.as_mut() {
                    if interaction.client == handle {
                        interaction.start_pointer = (root_x, root_y);
                    }
                }
                if let Some(hot) = s.clients.hot_mut(handle) {
                    hot.last_pointer = (root_x, root_y);
                }
            }
        }
        (kind, Err(err)) => {
            debug!("Query {:?} for entity {:?} failed: {}", kind, handle, err);
            if slot.flags.contains(CookieFlags::INITIAL) {
                // A manage cannot finish without its initial state.
                if let Some(hot) = s.clients.hot_mut(handle) {
                    hot.manage_aborted = true;
                }
            }
        }
        (kind, Ok(_)) => warn!("Query {:?} got a mismatched reply shape", kind),
    }
    finish_initial(s, slot);
}

/// Account one initial-state reply. When the last one lands the manage
/// either completes or unwinds, exactly once.
fn finish_initial<T: Transport>(s: &mut Server<T>, slot: CookieSlot) {
    if !slot.flags.contains(CookieFlags::INITIAL) {
        return;
    }
    let Some(hot) = s.clients.hot_mut(slot.owner) else {
        return;
    };
    hot.pending_replies = hot.pending_replies.saturating_sub(1);
    if hot.state != ClientState::New || hot.pending_replies != 0 {
        return;
    }
    if hot.manage_aborted {
        abort_manage(s, slot.owner);
    } else {
        finish_manage(s, slot.owner);
    }
}

/// Begin managing a window: allocate the entity, subscribe to its events,
/// and issue the initial attribute and geometry queries. The manage
/// completes asynchronously once both replies land.
pub(crate) fn manage_start<T: Transport>(s: &mut Server<T>, window: u32, map_state: u8, now: Instant) {
    if s.window_to_client.get(u64::from(window)).is_some() {
        return;
    }
    let handle = {
        let (handle, hot, cold) = s.clients.alloc();
        hot.xid = window;
        hot.state = ClientState::New;
        hot.pending_replies = 2;
        cold.map_state_at_adopt = map_state;
        handle
    };
    s.window_to_client.insert(u64::from(window), handle);

    s.transport.submit(Request::SelectInput {
        window,
        mask: EVENT_STRUCTURE_NOTIFY | EVENT_PROPERTY_CHANGE,
    });
    let seq = s.transport.submit(Request::GetWindowAttributes { window });
    if s.jar.push(seq, ReplyKind::WindowAttributes, handle, CookieFlags::INITIAL, 0, now) {
        s.stats.cookies_pushed += 1;
    }
    let seq = s.transport.submit(Request::GetGeometry { drawable: window });
    if s.jar.push(seq, ReplyKind::Geometry, handle, CookieFlags::INITIAL, 0, now) {
        s.stats.cookies_pushed += 1;
    }
    debug!("Managing window {} as {:?}", window, handle);
}

/// Both initial replies arrived and nothing disqualified the window:
/// create the frame, reparent, and map.
fn finish_manage<T: Transport>(s: &mut Server<T>, handle: Handle) {
    let root = s.transport.root();
    let frame = s.transport.generate_id();
    let border_width = s.config.frame.border_width;

    let Some((hot, cold)) = s.clients.pair_mut(handle) else {
        return;
    };
    hot.desired.w = hot.desired.w.max(1);
    hot.desired.h = hot.desired.h.max(1);
    hot.frame = frame;
    hot.state = ClientState::Mapped;
    hot.dirty |= DirtyFlags::GEOM | DirtyFlags::STACK | DirtyFlags::FRAME;
    if cold.map_state_at_adopt == MAP_STATE_VIEWABLE {
        // Reparenting an already-mapped window synthesizes an UnmapNotify
        // that must not be mistaken for the client withdrawing.
        hot.ignore_unmap += 1;
    }
    let xid = hot.xid;
    let desired = hot.desired;
    let layer = hot.layer;

    s.frame_to_client.insert(u64::from(frame), handle);
    s.stacking.push(layer, handle);
    s.root_dirty |= RootDirty::CLIENT_LIST | RootDirty::CLIENT_LIST_STACKING;

    s.transport.submit(Request::CreateFrame {
        frame,
        parent: root,
        x: desired.x,
        y: desired.y,
        width: desired.w,
        height: desired.h,
        border_width,
    });
    s.transport.submit(Request::ReparentWindow { window: xid, parent: frame, x: 0, y: 0 });
    s.transport.submit(Request::MapWindow { window: frame });
    s.transport.submit(Request::MapWindow { window: xid });

    s.stats.clients_managed += 1;
    info!("Managed window {} in frame {}", xid, frame);
}

/// Unwind a manage that never completed. No frame exists yet; only the
/// entity and its window mapping need releasing.
fn abort_manage<T: Transport>(s: &mut Server<T>, handle: Handle) {
    let Some(hot) = s.clients.hot(handle) else {
        return;
    };
    let xid = hot.xid;
    debug!("Abandoning manage of window {}", xid);
    s.window_to_client.remove(u64::from(xid));
    s.clients.free(handle);
}

/// Hide a mapped client without releasing it. The entity stays in the
/// store and in the stacking order; a later map request brings it back.
fn iconify<T: Transport>(s: &mut Server<T>, handle: Handle) {
    let Some(hot) = s.clients.hot_mut(handle) else {
        return;
    };
    if hot.state != ClientState::Mapped {
        return;
    }
    hot.state = ClientState::Unmapped;
    // Unmapping our own client synthesizes an UnmapNotify that must not
    // be mistaken for the client withdrawing.
    hot.ignore_unmap += 1;
    let xid = hot.xid;
    let frame = hot.frame;

    s.transport.submit(Request::UnmapWindow { window: frame });
    s.transport.submit(Request::UnmapWindow { window: xid });
    if s.active_window == xid {
        s.active_window = 0;
        s.root_dirty |= RootDirty::ACTIVE_WINDOW;
    }
    debug!("Iconified window {}", xid);
}

/// Tear down a managed client: drop both id mappings, destroy the frame,
/// and release the entity. Replies still in flight for it will be dropped
/// as stale when they arrive.
pub(crate) fn unmanage<T: Transport>(s: &mut Server<T>, handle: Handle) {
    let Some(hot) = s.clients.hot_mut(handle) else {
        return;
    };
    hot.state = ClientState::Unmanaging;
    let xid = hot.xid;
    let frame = hot.frame;
    let layer = hot.layer;

    s.window_to_client.remove(u64::from(xid));
    if frame != 0 {
        s.frame_to_client.remove(u64::from(frame));
        s.transport.submit(Request::DestroyWindow { window: frame });
    }
    s.stacking.remove(layer, handle);
    if s.active_window == xid {
        s.active_window = 0;
        s.root_dirty |= RootDirty::ACTIVE_WINDOW;
    }
    s.root_dirty |= RootDirty::CLIENT_LIST | RootDirty::CLIENT_LIST_STACKING;
    if let Some(interaction) = s.interaction {
        if interaction.client == handle {
            s.interaction = None;
            s.txn_id += 1;
        }
    }
    s.clients.free(handle);
    s.stats.clients_unmanaged += 1;
    debug!("Unmanaged window {}", xid);
}

/// Walk this cycle's buckets in stage order. Containers are taken out of
/// the buckets while iterated and put back afterwards so their capacity
/// survives into the next cycle.
pub(crate) fn run<T: Transport>(s: &mut Server<T>, now: Instant) {
    // Lifecycle first. Map requests for windows destroyed later in the
    // same batch are dead on arrival.
    let map_requests = mem::take(&mut s.buckets.map_requests);
    for &window in map_requests.iter() {
        if s.buckets.destroyed.get(u64::from(window)).is_some() {
            trace!("Map request for {} beaten by its destroy", window);
            continue;
        }
        handle_map_request(s, window, now);
    }
    s.buckets.map_requests = map_requests;

    let unmaps = mem::take(&mut s.buckets.unmap_notifies);
    for &window in unmaps.iter() {
        if s.buckets.destroyed.get(u64::from(window)).is_some() {
            continue;
        }
        handle_unmap_notify(s, window);
    }
    s.buckets.unmap_notifies = unmaps;

    let destroys = mem::take(&mut s.buckets.destroy_notifies);
    for &window in destroys.iter() {
        if let Some(&handle) = s.window_to_client.get(u64::from(window)) {
            unmanage(s, handle);
        }
    }
    s.buckets.destroy_notifies = destroys;

    for &(window, override_redirect) in s.buckets.create_notifies.iter() {
        trace!("Window {} created (override_redirect {})", window, override_redirect);
    }

    // Input.
    for &(keycode, state) in s.buckets.key_presses.iter() {
        // Binding dispatch lives outside the core.
        debug!("Key press {} with modifiers {:#06x}", keycode, state);
    }

    let buttons = mem::take(&mut s.buckets.button_events);
    for &event in buttons.iter() {
        handle_button(s, event, now);
    }
    s.buckets.button_events = buttons;

    // Frame repaint damage from exposure.
    let exposes = mem::take(&mut s.buckets.expose_regions);
    for (frame, region) in exposes.iter() {
        if !region.valid {
            continue;
        }
        if let Some(&handle) = s.frame_to_client.get(frame) {
            if let Some(hot) = s.clients.hot_mut(handle) {
                hot.frame_damage.union_rect(region.x, region.y, region.w, region.h);
                hot.dirty |= DirtyFlags::FRAME;
            }
        }
    }
    s.buckets.expose_regions = exposes;

    let messages = mem::take(&mut s.buckets.client_messages);
    for &message in messages.iter() {
        let iconic = message.message_type == s.transport.atoms().wm_change_state
            && message.format == 32
            && message.data[0] == WM_STATE_ICONIC;
        if iconic {
            if let Some(&handle) = s.window_to_client.get(u64::from(message.window)) {
                iconify(s, handle);
            }
            continue;
        }
        // Other protocol-level messages are handled outside the core.
        debug!(
            "Client message type {} for window {}",
            message.message_type, message.window
        );
    }
    s.buckets.client_messages = messages;

    // Pointer.
    if let Some((window, x, y)) = s.buckets.pointer_enter {
        if let Some(&handle) = lookup(s, window) {
            if let Some(hot) = s.clients.hot_mut(handle) {
                hot.last_pointer = (x, y);
            }
        }
    }
    if let Some(window) = s.buckets.pointer_leave {
        trace!("Pointer left window {}", window);
    }
    let motions = mem::take(&mut s.buckets.motion_notifies);
    for (window, motion) in motions.iter() {
        handle_motion(s, window as u32, *motion);
    }
    s.buckets.motion_notifies = motions;

    // Geometry.
    let configure_requests = mem::take(&mut s.buckets.configure_requests);
    for (window, pending) in configure_requests.iter() {
        let window = window as u32;
        match s.window_to_client.get(u64::from(window)).copied() {
            Some(handle) if s.clients.is_live(handle) => {
                handle_configure_request(s, handle, *pending);
            }
            _ => {
                // Unmanaged windows get exactly what they asked for.
                s.transport.submit(Request::ConfigureWindow {
                    window,
                    mask: pending.mask,
                    values: pending.values,
                });
            }
        }
    }
    s.buckets.configure_requests = configure_requests;

    let configure_notifies = mem::take(&mut s.buckets.configure_notifies);
    for (window, rect) in configure_notifies.iter() {
        if let Some(&handle) = lookup(s, window as u32) {
            if let Some(hot) = s.clients.hot_mut(handle) {
                hot.server = *rect;
            }
        }
    }
    s.buckets.configure_notifies = configure_notifies;

    // Properties.
    let properties = mem::take(&mut s.buckets.property_notifies);
    for (_, event) in properties.iter() {
        if s.buckets.destroyed.get(u64::from(event.window)).is_some() {
            continue;
        }
        let Some(&handle) = s.window_to_client.get(u64::from(event.window)) else {
            continue;
        };
        let Some((hot, cold)) = s.clients.pair_mut(handle) else {
            continue;
        };
        if event.deleted {
            cold.properties.remove(u64::from(event.atom));
            hot.dirty |= DirtyFlags::FRAME;
        } else {
            let atom = u64::from(event.atom);
            if !hot.changed_atoms.iter().any(|&a| a == atom) {
                hot.changed_atoms.push(atom);
            }
            hot.dirty |= DirtyFlags::PROPS;
        }
    }
    s.buckets.property_notifies = properties;

    // Damage.
    let damage = mem::take(&mut s.buckets.damage_regions);
    for (drawable, region) in damage.iter() {
        if !region.valid {
            continue;
        }
        if let Some(&handle) = lookup(s, drawable as u32) {
            if let Some(hot) = s.clients.hot_mut(handle) {
                hot.frame_damage.union_rect(region.x, region.y, region.w, region.h);
                hot.dirty |= DirtyFlags::FRAME;
            }
        }
    }
    s.buckets.damage_regions = damage;

    if let Some((width, height)) = s.buckets.screen_change {
        info!("Screen changed to {}x{}", width, height);
        s.workarea = Rect::new(0, 0, width, height);
        s.root_dirty |= RootDirty::WORKAREA;
    }
}

/// Resolve a window id whether it names a client window or a frame.
fn lookup<T: Transport>(s: &Server<T>, window: u32) -> Option<&Handle> {
    s.window_to_client
        .get(u64::from(window))
        .or_else(|| s.frame_to_client.get(u64::from(window)))
}

fn handle_map_request<T: Transport>(s: &mut Server<T>, window: u32, now: Instant) {
    if let Some(&handle) = s.window_to_client.get(u64::from(window)) {
        if let Some(hot) = s.clients.hot_mut(handle) {
            if hot.state == ClientState::Unmapped {
                hot.state = ClientState::Mapped;
                hot.dirty |= DirtyFlags::STACK;
                let frame = hot.frame;
                s.transport.submit(Request::MapWindow { window: frame });
                s.transport.submit(Request::MapWindow { window });
                s.root_dirty |= RootDirty::CLIENT_LIST_STACKING;
            }
            return;
        }
        // Stale mapping from an entity freed this generation.
        s.window_to_client.remove(u64::from(window));
    }
    manage_start(s, window, MAP_STATE_UNMAPPED, now);
}

fn handle_unmap_notify<T: Transport>(s: &mut Server<T>, window: u32) {
    let Some(&handle) = s.window_to_client.get(u64::from(window)) else {
        return;
    };
    let Some(hot) = s.clients.hot_mut(handle) else {
        return;
    };
    if hot.ignore_unmap > 0 {
        hot.ignore_unmap -= 1;
        trace!("Ignoring reparent-synthesized unmap for {}", window);
        return;
    }
    unmanage(s, handle);
}

fn handle_button<T: Transport>(s: &mut Server<T>, event: ButtonEvent, now: Instant) {
    if !event.pressed {
        if s.interaction.take().is_some() {
            // Orphan any pointer queries issued for this interaction.
            s.txn_id += 1;
        }
        return;
    }
    let Some(&handle) = s.frame_to_client.get(u64::from(event.window)) else {
        return;
    };
    let Some(hot) = s.clients.hot(handle) else {
        return;
    };
    let xid = hot.xid;
    let server = hot.server;
    if s.active_window != xid {
        s.active_window = xid;
        s.root_dirty |= RootDirty::ACTIVE_WINDOW;
    }
    // Button 1 on the frame drags, button 3 resizes from the bottom-right.
    let kind = match event.detail {
        1 => Some(InteractionKind::Move),
        3 => Some(InteractionKind::Resize),
        _ => None,
    };
    if let Some(kind) = kind {
        s.txn_id += 1;
        s.interaction = Some(Interaction {
            kind,
            client: handle,
            start_pointer: (event.root_x, event.root_y),
            start_rect: server,
        });
        let root = s.transport.root();
        let seq = s.transport.submit(Request::QueryPointer { window: root });
        if s.jar.push(seq, ReplyKind::Pointer, handle, CookieFlags::empty(), s.txn_id, now) {
            s.stats.cookies_pushed += 1;
        }
    }
}

fn handle_motion<T: Transport>(s: &mut Server<T>, window: u32, motion: MotionEvent) {
    if let Some(interaction) = s.interaction {
        match s.clients.hot_mut(interaction.client) {
            Some(hot) => {
                let dx = i32::from(motion.root_x) - i32::from(interaction.start_pointer.0);
                let dy = i32::from(motion.root_y) - i32::from(interaction.start_pointer.1);
                match interaction.kind {
                    InteractionKind::Move => {
                        hot.desired.x = (i32::from(interaction.start_rect.x) + dx) as i16;
                        hot.desired.y = (i32::from(interaction.start_rect.y) + dy) as i16;
                    }
                    InteractionKind::Resize => {
                        let w = i32::from(interaction.start_rect.w) + dx;
                        let h = i32::from(interaction.start_rect.h) + dy;
                        hot.desired.w = w.clamp(1, i32::from(u16::MAX)) as u16;
                        hot.desired.h = h.clamp(1, i32::from(u16::MAX)) as u16;
                    }
                }
                hot.dirty |= DirtyFlags::GEOM;
                hot.last_pointer = (motion.root_x, motion.root_y);
                return;
            }
            None => {
                s.interaction = None;
                s.txn_id += 1;
            }
        }
    }
    if let Some(&handle) = lookup(s, window) {
        if let Some(hot) = s.clients.hot_mut(handle) {
            hot.last_pointer = (motion.root_x, motion.root_y);
        }
    }
}

fn handle_configure_request<T: Transport>(s: &mut Server<T>, handle: Handle, pending: PendingGeometry) {
    const GEOM_FIELDS: ConfigureMask = ConfigureMask::X
        .union(ConfigureMask::Y)
        .union(ConfigureMask::WIDTH)
        .union(ConfigureMask::HEIGHT);
    const STACK_FIELDS: ConfigureMask = ConfigureMask::SIBLING.union(ConfigureMask::STACK_MODE);

    let Some(hot) = s.clients.hot_mut(handle) else {
        return;
    };
    let mask = pending.mask;
    let values = pending.values;
    if mask.contains(ConfigureMask::X) {
        hot.desired.x = values.x;
    }
    if mask.contains(ConfigureMask::Y) {
        hot.desired.y = values.y;
    }
    if mask.contains(ConfigureMask::WIDTH) {
        hot.desired.w = values.width.max(1);
    }
    if mask.contains(ConfigureMask::HEIGHT) {
        hot.desired.h = values.height.max(1);
    }
    if mask.intersects(GEOM_FIELDS) {
        hot.dirty |= DirtyFlags::GEOM;
    }
    if !mask.intersects(STACK_FIELDS) {
        return;
    }
    hot.dirty |= DirtyFlags::STACK;
    let layer = hot.layer;
    let raise = mask.contains(ConfigureMask::STACK_MODE) && values.stack_mode == STACK_MODE_ABOVE;
    if raise {
        // Move to the top of its layer; the flush restack reasserts order.
        s.stacking.remove(layer, handle);
        s.stacking.push(layer, handle);
    }
    s.root_dirty |= RootDirty::CLIENT_LIST_STACKING;
}
