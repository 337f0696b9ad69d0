//! In-process pair of buses wired back to back, for tests and offline tooling.
//!
//! Each side's publishes are dispatched on the other side's router, which is
//! what a relay peer echoing through a socket looks like from either end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Bus, TopicRouter};

/// Shared open/closed switch for a loopback pair.
#[derive(Clone, Debug)]
pub struct LoopbackLink {
    open: Arc<AtomicBool>,
}

impl LoopbackLink {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

pub struct LoopbackPair {
    pub left: Bus,
    pub right: Bus,
    pub link: LoopbackLink,
}

pub fn pair(max_frame_bytes: usize) -> LoopbackPair {
    let link = LoopbackLink {
        open: Arc::new(AtomicBool::new(true)),
    };
    let left_router = TopicRouter::with_max_frame_bytes(max_frame_bytes);
    let right_router = TopicRouter::with_max_frame_bytes(max_frame_bytes);

    let left = Bus::new(left_router.clone(), sink_into(right_router.clone(), link.clone()));
    let right = Bus::new(right_router, sink_into(left_router, link.clone()));
    LoopbackPair { left, right, link }
}

fn sink_into(peer: TopicRouter, link: LoopbackLink) -> Arc<dyn crate::FrameSink> {
    Arc::new(move |text: String| {
        if !link.is_open() {
            return false;
        }
        peer.dispatch_text(&text);
        true
    })
}
