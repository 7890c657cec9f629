//! Ingestion: pull a bounded batch of raw events from the transport and
//! coalesce them into the cycle's buckets. Ordering-sensitive kinds are
//! queued in arrival order; mergeable kinds collapse to one entry per key
//! so a storm of configures or damage costs one unit of processing.

use tracing::trace;

use crate::transport::{RawEvent, Transport};
use crate::wm::buckets::{
    ButtonEvent, ClientMessageEvent, EventBuckets, MotionEvent, PendingGeometry, PropertyEvent,
};
use crate::wm::client::Region;
use crate::wm::Server;

pub(crate) fn run<T: Transport>(s: &mut Server<T>) {
    let max = s.config.limits.max_events_per_cycle;
    let mut count = 0;
    while count < max {
        let Some(event) = s.transport.poll_event() else {
            break;
        };
        count += 1;
        ingest_one(s, event);
    }
    if count == max {
        // Stopped by the bound; unread events may remain buffered, so the
        // next wait must not block.
        s.poll_again = true;
    }
    s.buckets.ingested = count;
    s.stats.events_ingested += u64::from(count);
    s.stats.events_coalesced += u64::from(s.buckets.coalesced);
}

fn ingest_one<T: Transport>(s: &mut Server<T>, event: RawEvent) {
    let b = &mut s.buckets;
    match event {
        RawEvent::CreateNotify { window, override_redirect } => {
            b.create_notifies.push((window, override_redirect));
        }
        RawEvent::MapRequest { window } => {
            b.map_requests.push(window);
        }
        RawEvent::MapNotify { .. } => {}
        RawEvent::UnmapNotify { window } => {
            b.unmap_notifies.push(window);
        }
        RawEvent::DestroyNotify { window } => {
            b.destroyed.insert(u64::from(window), ());
            // Pending configures for a dead window are wasted work.
            b.configure_requests.remove(u64::from(window));
            b.destroy_notifies.push(window);
        }
        RawEvent::KeyPress { keycode, state } => {
            b.key_presses.push((keycode, state));
        }
        RawEvent::Button { window, detail, state, root_x, root_y, pressed } => {
            // Press/release ordering matters; never coalesced.
            b.button_events.push(ButtonEvent { window, detail, state, root_x, root_y, pressed });
        }
        RawEvent::ClientMessage { window, message_type, format, data } => {
            b.client_messages.push(ClientMessageEvent { window, message_type, format, data });
        }
        RawEvent::ConfigureRequest { window, mask, values } => {
            if let Some(existing) = b.configure_requests.get_mut(u64::from(window)) {
                existing.merge(mask, values);
                b.coalesced += 1;
            } else {
                b.configure_requests.insert(u64::from(window), PendingGeometry::new(mask, values));
            }
        }
        RawEvent::ConfigureNotify { window, x, y, width, height } => {
            let rect = crate::wm::client::Rect::new(x, y, width, height);
            if b.configure_notifies.insert(u64::from(window), rect).is_some() {
                b.coalesced += 1;
            }
        }
        RawEvent::PropertyNotify { window, atom, deleted } => {
            let key = EventBuckets::property_key(window, atom);
            let entry = PropertyEvent { window, atom, deleted };
            if b.property_notifies.insert(key, entry).is_some() {
                b.coalesced += 1;
            }
        }
        RawEvent::Motion { window, root_x, root_y, state } => {
            let entry = MotionEvent { root_x, root_y, state };
            if b.motion_notifies.insert(u64::from(window), entry).is_some() {
                b.coalesced += 1;
            }
        }
        RawEvent::Enter { window, root_x, root_y } => {
            if b.pointer_enter.replace((window, root_x, root_y)).is_some() {
                b.coalesced += 1;
            }
        }
        RawEvent::Leave { window } => {
            if b.pointer_leave.replace(window).is_some() {
                b.coalesced += 1;
            }
        }
        RawEvent::Expose { window, x, y, width, height } => {
            if let Some(region) = b.expose_regions.get_mut(u64::from(window)) {
                region.union_rect(x as i16, y as i16, width, height);
                b.coalesced += 1;
            } else {
                b.expose_regions.insert(
                    u64::from(window),
                    Region::from_rect(x as i16, y as i16, width, height),
                );
            }
        }
        RawEvent::Damage { drawable, x, y, width, height } => {
            if let Some(region) = b.damage_regions.get_mut(u64::from(drawable)) {
                region.union_rect(x, y, width, height);
                b.coalesced += 1;
            } else {
                b.damage_regions.insert(u64::from(drawable), Region::from_rect(x, y, width, height));
            }
        }
        RawEvent::ColormapNotify { window, colormap, installed } => {
            // Cheap enough to apply inline; never bucketed.
            trace!("Colormap {} on window {} (installed {})", colormap, window, installed);
            if installed {
                if let Some(&handle) = s.window_to_client.get(u64::from(window)) {
                    if let Some(hot) = s.clients.hot_mut(handle) {
                        hot.colormap = colormap;
                    }
                }
            }
        }
        RawEvent::ScreenChange { width, height } => {
            if s.buckets.screen_change.replace((width, height)).is_some() {
                s.buckets.coalesced += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::mock::MockTransport;
    use crate::transport::{ConfigureMask, ConfigureValues};

    fn test_server() -> Server<MockTransport> {
        Server::new(MockTransport::new(), Config::default())
    }

    #[test]
    fn bounded_ingest_leaves_excess_at_source() {
        let mut server = test_server();
        server.config.limits.max_events_per_cycle = 8;
        for w in 1..=11u32 {
            server.transport.push_event(RawEvent::MapRequest { window: w });
        }

        run(&mut server);
        assert_eq!(server.buckets.ingested, 8);
        assert!(server.poll_again);
        assert_eq!(server.transport.events.len(), 3);

        // Draining the rest clears the flag's cause.
        server.poll_again = false;
        server.buckets.reset();
        run(&mut server);
        assert_eq!(server.buckets.ingested, 3);
        assert!(!server.poll_again);
    }

    #[test]
    fn configure_requests_coalesce_by_window() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::ConfigureRequest {
            window: 42,
            mask: ConfigureMask::X | ConfigureMask::Y | ConfigureMask::WIDTH,
            values: ConfigureValues { x: 1, y: 2, width: 300, ..Default::default() },
        });
        server.transport.push_event(RawEvent::ConfigureRequest {
            window: 42,
            mask: ConfigureMask::HEIGHT,
            values: ConfigureValues { height: 400, ..Default::default() },
        });

        run(&mut server);
        assert_eq!(server.buckets.coalesced, 1);
        let pg = server.buckets.configure_requests.get(42).unwrap();
        assert_eq!(
            pg.mask,
            ConfigureMask::X | ConfigureMask::Y | ConfigureMask::WIDTH | ConfigureMask::HEIGHT
        );
        assert_eq!((pg.values.x, pg.values.y, pg.values.width, pg.values.height), (1, 2, 300, 400));
    }

    #[test]
    fn destroy_cancels_pending_configure() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::ConfigureRequest {
            window: 42,
            mask: ConfigureMask::X,
            values: ConfigureValues { x: 5, ..Default::default() },
        });
        server.transport.push_event(RawEvent::DestroyNotify { window: 42 });

        run(&mut server);
        assert!(server.buckets.configure_requests.get(42).is_none());
        assert!(server.buckets.destroyed.get(42).is_some());
        assert_eq!(server.buckets.destroy_notifies.as_slice(), &[42]);
    }

    #[test]
    fn damage_rects_union_to_bounding_box() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::Damage {
            drawable: 9,
            x: 0,
            y: 0,
            width: 10,
            height: 10,
        });
        server.transport.push_event(RawEvent::Damage {
            drawable: 9,
            x: 5,
            y: 5,
            width: 10,
            height: 10,
        });

        run(&mut server);
        assert_eq!(server.buckets.coalesced, 1);
        let region = server.buckets.damage_regions.get(9).unwrap();
        assert_eq!((region.x, region.y, region.w, region.h), (0, 0, 15, 15));
    }

    #[test]
    fn latest_motion_wins_per_window() {
        let mut server = test_server();
        for i in 0..5 {
            server.transport.push_event(RawEvent::Motion {
                window: 7,
                root_x: i,
                root_y: i,
                state: 0,
            });
        }
        run(&mut server);
        assert_eq!(server.buckets.coalesced, 4);
        let motion = server.buckets.motion_notifies.get(7).unwrap();
        assert_eq!((motion.root_x, motion.root_y), (4, 4));
    }
}
