#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use shm_am::{
    AmConfig, AmPtl, Completion, EpId, KassistMode, MatchedQueue, RecvTarget, RequestId,
    RtsToken, Tag,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

static NEXT: AtomicU64 = AtomicU64::new(1);

/// Config under a prefix no other test uses.
pub fn config() -> AmConfig {
    AmConfig {
        prefix: format!(
            "shm_am_it_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ),
        short_q_depth: 64,
        long_q_depth: 32,
        long_elem_size: 8192,
        kassist_mode: KassistMode::Off,
        init_wait: Duration::from_secs(2),
        detach_wait: Duration::from_millis(50),
        ..AmConfig::default()
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
pub enum MqEvent {
    Envelope {
        src: EpId,
        tag: Tag,
        len: usize,
        payload: Vec<u8>,
    },
    Data {
        src: EpId,
        tag: Tag,
        offset: usize,
        payload: Vec<u8>,
    },
    Rts {
        src: EpId,
        tag: Tag,
        len: usize,
        token: RtsToken,
    },
    Complete {
        req: RequestId,
        completion: Completion,
    },
}

pub type Events = Arc<Mutex<Vec<MqEvent>>>;

/// Matched queue that records everything it is handed.
///
/// With `auto_match`, every rendezvous is matched on arrival with a receive
/// request numbered from 1000 and a buffer as long as the message.
pub struct RecordingMq {
    pub events: Events,
    pub auto_match: bool,
    next_recv: u64,
}

impl RecordingMq {
    pub fn new(auto_match: bool) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            auto_match,
            next_recv: 1000,
        }
    }
}

impl MatchedQueue for RecordingMq {
    fn deliver_envelope(&mut self, src: EpId, tag: Tag, msg_len: usize, payload: &[u8]) {
        self.events.lock().unwrap().push(MqEvent::Envelope {
            src,
            tag,
            len: msg_len,
            payload: payload.to_vec(),
        });
    }

    fn deliver_data(&mut self, src: EpId, tag: Tag, offset: usize, payload: &[u8]) {
        self.events.lock().unwrap().push(MqEvent::Data {
            src,
            tag,
            offset,
            payload: payload.to_vec(),
        });
    }

    fn deliver_rts(
        &mut self,
        src: EpId,
        tag: Tag,
        msg_len: usize,
        token: RtsToken,
    ) -> Option<RecvTarget> {
        self.events.lock().unwrap().push(MqEvent::Rts {
            src,
            tag,
            len: msg_len,
            token,
        });
        if !self.auto_match {
            return None;
        }
        let req = RequestId(self.next_recv);
        self.next_recv += 1;
        Some(RecvTarget { req, len: msg_len })
    }

    fn complete_request(&mut self, req: RequestId, completion: Completion) {
        self.events
            .lock()
            .unwrap()
            .push(MqEvent::Complete { req, completion });
    }
}

/// Bytes of every completed receive, in completion order.
pub fn received(events: &Events) -> Vec<(RequestId, Vec<u8>)> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            MqEvent::Complete {
                req,
                completion: Completion::Received(buf),
            } => Some((*req, buf.clone())),
            _ => None,
        })
        .collect()
}

/// Send requests completed so far.
pub fn sent(events: &Events) -> Vec<RequestId> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            MqEvent::Complete {
                req,
                completion: Completion::Sent,
            } => Some(*req),
            _ => None,
        })
        .collect()
}

/// Eager messages rebuilt from envelopes and data chunks, per tag.
pub fn eager_messages(events: &Events) -> Vec<(Tag, Vec<u8>)> {
    let mut out: Vec<(Tag, Vec<u8>)> = Vec::new();
    for e in events.lock().unwrap().iter() {
        match e {
            MqEvent::Envelope {
                tag, len, payload, ..
            } => {
                let mut buf = vec![0u8; *len];
                buf[..payload.len()].copy_from_slice(payload);
                out.push((*tag, buf));
            }
            MqEvent::Data {
                tag,
                offset,
                payload,
                ..
            } => {
                let (_, buf) = out
                    .iter_mut()
                    .rev()
                    .find(|(t, _)| t == tag)
                    .expect("data chunk before its envelope");
                buf[*offset..*offset + payload.len()].copy_from_slice(payload);
            }
            _ => {}
        }
    }
    out
}

pub fn event_count(events: &Events) -> usize {
    events.lock().unwrap().len()
}

/// Poll `ptl` until `done` holds or the timeout expires.
pub fn drive<M: MatchedQueue>(ptl: &mut AmPtl<M>, mut done: impl FnMut(&AmPtl<M>) -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done(ptl) {
        assert!(Instant::now() < deadline, "timed out driving endpoint");
        ptl.poll().expect("poll failed");
    }
}

/// Wait without polling anything ourselves.
pub fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// An endpoint polled on its own thread until joined.
pub struct Poller<M: MatchedQueue + Send + 'static> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<AmPtl<M>>,
}

impl<M: MatchedQueue + Send + 'static> Poller<M> {
    pub fn spawn(ptl: AmPtl<M>) -> Self {
        Self::spawn_with(ptl, |_| {})
    }

    /// Run `first` on the thread, then poll.
    pub fn spawn_with(
        mut ptl: AmPtl<M>,
        first: impl FnOnce(&mut AmPtl<M>) + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            first(&mut ptl);
            while !flag.load(Ordering::Acquire) {
                ptl.poll().expect("peer poll failed");
            }
            ptl
        });
        Self { stop, handle }
    }

    pub fn join(self) -> AmPtl<M> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().expect("peer thread panicked")
    }
}

/// Two endpoints on node 0 sharing one prefix.
pub fn pair(a_mq: RecordingMq, b_mq: RecordingMq, config: AmConfig) -> (AmPtl<RecordingMq>, AmPtl<RecordingMq>) {
    let a = AmPtl::new(EpId::new(0, 1), config.clone(), a_mq).expect("create a");
    let b = AmPtl::new(EpId::new(0, 2), config, b_mq).expect("create b");
    (a, b)
}

/// Connect `a` to `b` while `b` is polled on a thread.
pub fn connect(a: &mut AmPtl<RecordingMq>, b: AmPtl<RecordingMq>) -> AmPtl<RecordingMq> {
    let peer = b.epid();
    let poller = Poller::spawn(b);
    let results = a.connect(&[peer], TIMEOUT).expect("connect");
    assert!(results[0].is_ok(), "connect failed: {:?}", results[0]);
    poller.join()
}
