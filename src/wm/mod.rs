//! The event-processing core.
//!
//! A single-threaded, readiness-driven loop. Each wakeup runs one cycle:
//! ingest a bounded batch of events into coalescing buckets, drain
//! completed query replies through the cookie jar, process the buckets
//! against the entity store, then flush the minimal outbound requests
//! implied by the accumulated dirty bits. The multiplexer wait between
//! cycles is the only suspension point; nothing inside a cycle blocks.

pub mod buckets;
pub mod client;
pub mod cookies;
pub mod flush;
pub mod ingest;
pub mod process;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Arena, Handle, OpenHash, SlotMap};
use crate::stats::Stats;
use crate::transport::Transport;

use buckets::EventBuckets;
use client::{ClientCold, ClientHot, Rect, RootDirty, Stacking};
use cookies::{CookieFlags, CookieJar, ReplyKind};

const X_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);

/// Where a cycle currently is. Transitions are unconditional and in
/// order; no state persists across cycles except the entity store, dirty
/// bits, and the jar's pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    #[default]
    Idle,
    Ingesting,
    DrainingReplies,
    Processing,
    Flushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Move,
    Resize,
}

/// An in-progress pointer-driven move or resize. Cancelling bumps the
/// server's transaction id, which orphans any pointer replies issued for
/// the previous interaction.
#[derive(Debug, Clone, Copy)]
pub struct Interaction {
    pub kind: InteractionKind,
    pub client: Handle,
    pub start_pointer: (i16, i16),
    pub start_rect: Rect,
}

/// Flags flipped from signal handlers, consumed at the top of each loop
/// iteration.
#[derive(Clone)]
pub struct SignalFlags {
    pub shutdown: Arc<AtomicBool>,
    pub reload: Arc<AtomicBool>,
    pub dump_stats: Arc<AtomicBool>,
}

impl SignalFlags {
    pub fn new() -> Self {
        SignalFlags {
            shutdown: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
            dump_stats: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Server<T: Transport> {
    pub transport: T,
    pub config: Config,

    pub clients: SlotMap<ClientHot, ClientCold>,
    /// Client window id to entity.
    pub window_to_client: OpenHash<Handle>,
    /// Frame window id to entity.
    pub frame_to_client: OpenHash<Handle>,
    pub stacking: Stacking,

    pub buckets: EventBuckets,
    pub jar: CookieJar,
    pub tick_arena: Arena,

    pub root_dirty: RootDirty,
    pub active_window: u32,
    pub workarea: Rect,

    pub phase: CyclePhase,
    /// Work remains buffered at the source; the next wait must not block.
    pub poll_again: bool,
    /// Current interaction transaction. Pointer replies carrying an older
    /// id answer a superseded request and are ignored.
    pub txn_id: u64,
    pub interaction: Option<Interaction>,

    pub stats: Stats,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: Config) -> Self {
        let (width, height) = transport.screen_size();
        let workarea = Rect::new(0, 0, width, height);
        Server {
            clients: SlotMap::new(config.memory.entity_capacity),
            window_to_client: OpenHash::new(),
            frame_to_client: OpenHash::new(),
            stacking: Stacking::default(),
            buckets: EventBuckets::new(),
            jar: CookieJar::new(),
            tick_arena: Arena::new(config.memory.arena_block_size),
            root_dirty: RootDirty::empty(),
            active_window: 0,
            workarea,
            phase: CyclePhase::Idle,
            poll_again: false,
            txn_id: 1,
            interaction: None,
            stats: Stats::new(),
            transport,
            config,
        }
    }

    /// Query the root's children and probe each for adoption. The scan
    /// and its probes are unowned cookies; they dispatch regardless of
    /// entity liveness.
    pub fn adopt_existing(&mut self, now: Instant) {
        let root = self.transport.root();
        let seq = self.transport.submit(crate::transport::Request::QueryTree { window: root });
        if self.jar.push(seq, ReplyKind::AdoptionScan, Handle::INVALID, CookieFlags::empty(), 0, now) {
            self.stats.cookies_pushed += 1;
        }
    }

    /// One full cycle. The buckets and the tick arena live exactly this
    /// long; nothing allocated from them survives past the flush.
    pub fn run_cycle(&mut self, now: Instant) {
        let started = Instant::now();

        self.phase = CyclePhase::Ingesting;
        self.buckets.reset();
        ingest::run(self);

        self.phase = CyclePhase::DrainingReplies;
        process::drain_replies(self, now);

        self.phase = CyclePhase::Processing;
        process::run(self, now);

        self.phase = CyclePhase::Flushing;
        flush::run(self, now);

        self.phase = CyclePhase::Idle;
        self.stats.record_cycle(started.elapsed());
    }

    /// Readiness loop: block on the connection fd and the signal pipe,
    /// run one cycle per wakeup. Returns when a shutdown signal arrives
    /// or the connection dies.
    pub fn run(&mut self, mut signal_pipe: UnixStream, flags: SignalFlags) -> Result<()> {
        let mut poll = Poll::new().context("Failed to create poll instance")?;
        let mut events = Events::with_capacity(64);

        let x_fd = self.transport.raw_fd();
        if let Some(fd) = x_fd {
            poll.registry()
                .register(&mut SourceFd(&fd), X_TOKEN, Interest::READABLE)
                .context("Failed to register connection fd")?;
        }
        let sig_fd = signal_pipe.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&sig_fd), SIGNAL_TOKEN, Interest::READABLE)
            .context("Failed to register signal pipe")?;

        let now = Instant::now();
        self.adopt_existing(now);
        self.transport.flush();

        info!("Entering event loop");
        loop {
            if flags.shutdown.swap(false, Ordering::Relaxed) {
                info!("Shutdown requested");
                break;
            }
            if flags.reload.swap(false, Ordering::Relaxed) {
                self.reload_config();
            }
            if flags.dump_stats.swap(false, Ordering::Relaxed) {
                self.stats.dump();
            }

            let timeout = if self.poll_again {
                Some(Duration::ZERO)
            } else if !self.jar.is_empty() {
                // Wake in time to expire unanswered cookies.
                Some(self.config.cookie_timeout())
            } else {
                None
            };
            self.poll_again = false;

            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("Poll failed");
            }

            for event in events.iter() {
                if event.token() == SIGNAL_TOKEN {
                    drain_pipe(&mut signal_pipe);
                }
            }

            if !self.transport.healthy() {
                bail!("Lost connection to the display server");
            }
            self.run_cycle(Instant::now());
        }

        self.stats.dump();
        Ok(())
    }

    fn reload_config(&mut self) {
        match Config::load() {
            Ok(config) => {
                info!("Configuration reloaded");
                // Memory shape is fixed at startup; only limits take effect.
                self.config.limits = config.limits;
                self.config.frame = config.frame;
            }
            Err(err) => warn!("Config reload failed, keeping current: {:#}", err),
        }
    }
}

fn drain_pipe(pipe: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("Signal pipe read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, OwnedRequest};
    use crate::transport::{RawEvent, Reply, ReplyError, MAP_STATE_VIEWABLE};
    use client::{ClientState, DirtyFlags};

    fn test_server() -> Server<MockTransport> {
        Server::new(MockTransport::new(), Config::default())
    }

    fn manage_seqs(server: &Server<MockTransport>) -> (u64, u64) {
        let mut attrs = None;
        let mut geom = None;
        for (seq, req) in &server.transport.requests {
            match req {
                OwnedRequest::GetWindowAttributes { .. } => attrs = Some(*seq),
                OwnedRequest::GetGeometry { .. } => geom = Some(*seq),
                _ => {}
            }
        }
        (attrs.unwrap(), geom.unwrap())
    }

    #[test]
    fn map_request_starts_async_manage() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());

        let handle = *server.window_to_client.get(100).unwrap();
        let hot = server.clients.hot(handle).unwrap();
        assert_eq!(hot.state, ClientState::New);
        assert_eq!(hot.pending_replies, 2);
        assert_eq!(server.jar.len(), 2);
        // Nothing is mapped until the replies land.
        assert!(!server
            .transport
            .requests
            .iter()
            .any(|(_, r)| matches!(r, OwnedRequest::MapWindow { .. })));
        assert_eq!(server.transport.flush_count, 1);
    }

    #[test]
    fn manage_finishes_once_after_both_initial_replies() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        let (attr_seq, geom_seq) = manage_seqs(&server);
        let handle = *server.window_to_client.get(100).unwrap();

        server.transport.script_reply(
            attr_seq,
            Ok(Reply::WindowAttributes {
                override_redirect: false,
                map_state: 0,
                colormap: 7,
            }),
        );
        server.run_cycle(Instant::now());
        assert_eq!(server.clients.hot(handle).unwrap().state, ClientState::New);

        server.transport.script_reply(
            geom_seq,
            Ok(Reply::Geometry { x: 10, y: 20, width: 300, height: 200, border_width: 0, depth: 24 }),
        );
        server.transport.take_requests();
        server.run_cycle(Instant::now());

        let hot = server.clients.hot(handle).unwrap();
        assert_eq!(hot.state, ClientState::Mapped);
        assert_ne!(hot.frame, 0);
        assert_eq!(hot.desired, Rect::new(10, 20, 300, 200));
        assert_eq!(hot.colormap, 7);
        assert_eq!(server.stats.clients_managed, 1);

        let requests = server.transport.take_requests();
        assert!(requests.iter().any(|(_, r)| matches!(
            r,
            OwnedRequest::CreateFrame { parent: 1, .. }
        )));
        assert!(requests.iter().any(|(_, r)| matches!(
            r,
            OwnedRequest::ReparentWindow { window: 100, .. }
        )));
        assert_eq!(
            requests
                .iter()
                .filter(|(_, r)| matches!(r, OwnedRequest::MapWindow { .. }))
                .count(),
            2
        );
        // Client list republished.
        assert!(requests.iter().any(|(_, r)| matches!(
            r,
            OwnedRequest::ChangeProperty32 { window: 1, values, .. } if values == &vec![100]
        )));
    }

    #[test]
    fn override_redirect_aborts_manage() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        let (attr_seq, geom_seq) = manage_seqs(&server);
        let handle = *server.window_to_client.get(100).unwrap();

        server.transport.script_reply(
            attr_seq,
            Ok(Reply::WindowAttributes { override_redirect: true, map_state: 0, colormap: 0 }),
        );
        server.transport.script_reply(
            geom_seq,
            Ok(Reply::Geometry { x: 0, y: 0, width: 50, height: 50, border_width: 0, depth: 24 }),
        );
        server.run_cycle(Instant::now());

        assert!(!server.clients.is_live(handle));
        assert!(server.window_to_client.get(100).is_none());
        assert_eq!(server.stats.clients_managed, 0);
    }

    #[test]
    fn reply_for_freed_entity_is_discarded() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        let (attr_seq, _) = manage_seqs(&server);
        let handle = *server.window_to_client.get(100).unwrap();

        // Window dies while the queries are in flight.
        server.transport.push_event(RawEvent::DestroyNotify { window: 100 });
        server.run_cycle(Instant::now());
        assert!(!server.clients.is_live(handle));

        server.transport.script_reply(
            attr_seq,
            Ok(Reply::WindowAttributes { override_redirect: false, map_state: 0, colormap: 0 }),
        );
        server.run_cycle(Instant::now());
        assert_eq!(server.stats.cookies_stale_dropped, 1);
        assert_eq!(server.stats.cookies_dispatched, 0);
    }

    #[test]
    fn unknown_sequence_reply_is_counted_and_dropped() {
        let mut server = test_server();
        server.transport.script_reply(
            999,
            Err(ReplyError::Protocol { code: 3 }),
        );
        server.run_cycle(Instant::now());
        assert_eq!(server.stats.replies_unmatched, 1);
    }

    #[test]
    fn adoption_probes_manage_only_viewable_plain_windows() {
        let mut server = test_server();
        let now = Instant::now();
        server.adopt_existing(now);
        let scan_seq = server.transport.last_seq();
        server.transport.script_reply(
            scan_seq,
            Ok(Reply::Tree { children: vec![200, 201, 202] }),
        );
        server.run_cycle(now);

        // One probe per child.
        let probes: Vec<u64> = server
            .transport
            .requests
            .iter()
            .filter_map(|(seq, r)| {
                matches!(r, OwnedRequest::GetWindowAttributes { .. }).then_some(*seq)
            })
            .collect();
        assert_eq!(probes.len(), 3);

        // 200: viewable, adopt. 201: override-redirect, skip. 202: unmapped, skip.
        server.transport.script_reply(
            probes[0],
            Ok(Reply::WindowAttributes {
                override_redirect: false,
                map_state: MAP_STATE_VIEWABLE,
                colormap: 0,
            }),
        );
        server.transport.script_reply(
            probes[1],
            Ok(Reply::WindowAttributes {
                override_redirect: true,
                map_state: MAP_STATE_VIEWABLE,
                colormap: 0,
            }),
        );
        server.transport.script_reply(
            probes[2],
            Ok(Reply::WindowAttributes { override_redirect: false, map_state: 0, colormap: 0 }),
        );
        server.run_cycle(now);

        assert!(server.window_to_client.get(200).is_some());
        assert!(server.window_to_client.get(201).is_none());
        assert!(server.window_to_client.get(202).is_none());
    }

    #[test]
    fn reply_drain_is_bounded_and_carries_over() {
        let mut server = test_server();
        let now = Instant::now();
        server.adopt_existing(now);
        server.transport.script_reply(
            server.transport.last_seq(),
            Ok(Reply::Tree { children: vec![200, 201, 202, 203, 204] }),
        );
        server.run_cycle(now);

        let probes: Vec<u64> = server
            .transport
            .requests
            .iter()
            .filter_map(|(seq, r)| {
                matches!(r, OwnedRequest::GetWindowAttributes { .. }).then_some(*seq)
            })
            .collect();
        assert_eq!(probes.len(), 5);
        for &seq in &probes {
            server.transport.script_reply(
                seq,
                Ok(Reply::WindowAttributes { override_redirect: false, map_state: 0, colormap: 0 }),
            );
        }

        // Five answers waiting, two allowed per cycle.
        server.config.limits.max_replies_per_cycle = 2;
        server.poll_again = false;
        server.run_cycle(now);
        assert_eq!(server.jar.len(), 3);
        assert_eq!(server.transport.replies.len(), 3);
        assert!(server.poll_again);

        server.poll_again = false;
        server.run_cycle(now);
        assert_eq!(server.jar.len(), 1);
        assert!(server.poll_again);

        // The remainder fits under the bound; no further wakeup is forced.
        server.poll_again = false;
        server.run_cycle(now);
        assert_eq!(server.jar.len(), 0);
        assert_eq!(server.transport.replies.len(), 0);
        assert!(!server.poll_again);
    }

    #[test]
    fn cookie_timeout_expires_pending_queries() {
        let mut server = test_server();
        let start = Instant::now();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(start);
        assert_eq!(server.jar.len(), 2);

        let late = start + server.config.cookie_timeout() + Duration::from_secs(1);
        server.run_cycle(late);
        assert_eq!(server.jar.len(), 0);
        assert_eq!(server.stats.cookies_timed_out, 2);
        // The manage never finishes; the entity is released.
        assert!(server.window_to_client.get(100).is_none());
    }

    #[test]
    fn destroyed_client_leaves_no_dirty_work() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        let (attr_seq, geom_seq) = manage_seqs(&server);
        server.transport.script_reply(
            attr_seq,
            Ok(Reply::WindowAttributes { override_redirect: false, map_state: 0, colormap: 0 }),
        );
        server.transport.script_reply(
            geom_seq,
            Ok(Reply::Geometry { x: 0, y: 0, width: 100, height: 100, border_width: 0, depth: 24 }),
        );
        server.run_cycle(Instant::now());
        let handle = *server.window_to_client.get(100).unwrap();
        let frame = server.clients.hot(handle).unwrap().frame;

        server.transport.take_requests();
        server.transport.push_event(RawEvent::DestroyNotify { window: 100 });
        server.run_cycle(Instant::now());

        assert!(!server.clients.is_live(handle));
        assert!(server.frame_to_client.get(u64::from(frame)).is_none());
        assert_eq!(server.stats.clients_unmanaged, 1);
        let requests = server.transport.take_requests();
        assert!(requests.iter().any(|(_, r)| matches!(
            r,
            OwnedRequest::DestroyWindow { window } if *window == frame
        )));
        assert_eq!(server.stacking.iter_bottom_up().count(), 0);
    }

    #[test]
    fn iconify_unmaps_and_map_request_restores() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        let (attr_seq, geom_seq) = manage_seqs(&server);
        server.transport.script_reply(
            attr_seq,
            Ok(Reply::WindowAttributes { override_redirect: false, map_state: 0, colormap: 0 }),
        );
        server.transport.script_reply(
            geom_seq,
            Ok(Reply::Geometry { x: 0, y: 0, width: 100, height: 100, border_width: 0, depth: 24 }),
        );
        server.run_cycle(Instant::now());
        let handle = *server.window_to_client.get(100).unwrap();
        let frame = server.clients.hot(handle).unwrap().frame;
        server.transport.take_requests();

        let wm_change_state = server.transport.atoms().wm_change_state;
        server.transport.push_event(RawEvent::ClientMessage {
            window: 100,
            message_type: wm_change_state,
            format: 32,
            data: [3, 0, 0, 0, 0],
        });
        server.run_cycle(Instant::now());

        let hot = server.clients.hot(handle).unwrap();
        assert_eq!(hot.state, ClientState::Unmapped);
        assert_eq!(hot.ignore_unmap, 1);
        let requests = server.transport.take_requests();
        assert!(requests.iter().any(|(_, r)| matches!(
            r,
            OwnedRequest::UnmapWindow { window } if *window == frame
        )));
        assert!(requests
            .iter()
            .any(|(_, r)| matches!(r, OwnedRequest::UnmapWindow { window: 100 })));

        // The unmap we caused is not the client withdrawing.
        server.transport.push_event(RawEvent::UnmapNotify { window: 100 });
        server.run_cycle(Instant::now());
        assert!(server.clients.is_live(handle));
        assert_eq!(server.clients.hot(handle).unwrap().ignore_unmap, 0);

        server.transport.take_requests();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        assert_eq!(server.clients.hot(handle).unwrap().state, ClientState::Mapped);
        let requests = server.transport.take_requests();
        assert_eq!(
            requests
                .iter()
                .filter(|(_, r)| matches!(r, OwnedRequest::MapWindow { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn dirty_geometry_flushes_minimal_configures() {
        let mut server = test_server();
        server.transport.push_event(RawEvent::MapRequest { window: 100 });
        server.run_cycle(Instant::now());
        let (attr_seq, geom_seq) = manage_seqs(&server);
        server.transport.script_reply(
            attr_seq,
            Ok(Reply::WindowAttributes { override_redirect: false, map_state: 0, colormap: 0 }),
        );
        server.transport.script_reply(
            geom_seq,
            Ok(Reply::Geometry { x: 0, y: 0, width: 100, height: 100, border_width: 0, depth: 24 }),
        );
        server.run_cycle(Instant::now());
        let handle = *server.window_to_client.get(100).unwrap();
        server.transport.take_requests();

        // Pretend the server confirmed the flushed geometry, then move it.
        {
            let hot = server.clients.hot_mut(handle).unwrap();
            hot.server = hot.desired;
            hot.dirty = DirtyFlags::empty();
        }
        server.transport.push_event(RawEvent::ConfigureRequest {
            window: 100,
            mask: crate::transport::ConfigureMask::X | crate::transport::ConfigureMask::Y,
            values: crate::transport::ConfigureValues { x: 40, y: 50, ..Default::default() },
        });
        server.run_cycle(Instant::now());

        let requests = server.transport.take_requests();
        let configures: Vec<_> = requests
            .iter()
            .filter(|(_, r)| matches!(r, OwnedRequest::ConfigureWindow { .. }))
            .collect();
        assert!(!configures.is_empty());
        let hot = server.clients.hot(handle).unwrap();
        assert_eq!((hot.desired.x, hot.desired.y), (40, 50));
        assert!(hot.dirty.is_empty());

        // A cycle with nothing to do emits no configures.
        server.run_cycle(Instant::now());
        let requests = server.transport.take_requests();
        assert!(!requests.iter().any(|(_, r)| matches!(r, OwnedRequest::ConfigureWindow { .. })));
    }
}
