// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound message pump.
//!
//! A single worker owns transmit ordering. Commands and data sent to the
//! NFCC move to an awaiting-ack queue until the matching response or credit
//! arrives; a message unacknowledged for too long is retransmitted once and
//! then given up on. The worker also drives the recovery watchdogs.

use log::{debug, error, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::packets::{
    message_type, CORE_CONN_CREDITS, GID_CORE, GID_MASK, MAX_MSG_LEN, MT_CMD, MT_DATA, MT_NTF,
    MT_RSP, OID_MASK,
};
use crate::registry::RspHook;
use crate::{Endpoint, Error};

/// How long after sending do we consider a message lost.
const DELAY_FOR_ACK: Duration = Duration::from_millis(700);

/// Synthesized when the stack must restart NFC to recover.
pub(crate) const ABNORMAL_CORE_RESET_NTF: [u8; 8] =
    [0x60, 0x00, 0x05, 0x00, 0x01, 0x20, 0x02, 0x00];

pub(crate) type OutboundFn = Arc<dyn Fn(Endpoint, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogKind {
    /// No field-off seen within the delay after a field-on.
    FieldOnTooLong,
    /// No power-monitor-off seen within the delay after screen off.
    ActiveRwTooLong,
}

struct Watchdog {
    kind: WatchdogKind,
    deadline: Instant,
}

struct Msg {
    payload: Vec<u8>,
    to: Endpoint,
    sent_at: Instant,
    retried: bool,
    rsp: Option<RspHook>,
}

impl Msg {
    fn blank() -> Self {
        Msg {
            payload: Vec::with_capacity(MAX_MSG_LEN),
            to: Endpoint::Nfcc,
            sent_at: Instant::now(),
            retried: false,
            rsp: None,
        }
    }
}

#[derive(Default)]
struct Queues {
    to_send: VecDeque<Msg>,
    awaiting: VecDeque<Msg>,
    watchdogs: Vec<Watchdog>,
    must_exit: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    pool: Mutex<Vec<Msg>>,
    wake: Notify,
    out: OutboundFn,
}

impl Shared {
    fn msg_from_pool(&self) -> Msg {
        self.pool.lock().unwrap().pop().unwrap_or_else(Msg::blank)
    }

    fn recycle(&self, mut m: Msg) {
        m.payload.clear();
        m.retried = false;
        m.rsp = None;
        self.pool.lock().unwrap().push(m);
    }
}

/// Outcome of one worker pass, deciding how to wait for more work.
enum Step {
    Exit,
    Again,
    PollSoon,
    WaitUntil(Instant),
    Wait,
}

pub(crate) struct Pump {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Pump {
    pub fn new(out: OutboundFn) -> Result<Pump, Error> {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            pool: Mutex::new(Vec::new()),
            wake: Notify::new(),
            out,
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(Error::PumpStart)?;
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("nci-pump".into())
            .spawn(move || runtime.block_on(run(worker_shared)))
            .map_err(Error::PumpStart)?;

        Ok(Pump { shared, worker: Mutex::new(Some(worker)) })
    }

    /// Queue a message for transmission. The payload is copied.
    pub fn post(&self, to: Endpoint, payload: &[u8], rsp: Option<RspHook>) -> bool {
        if payload.len() > MAX_MSG_LEN {
            error!("message is too long: {}", payload.len());
            return false;
        }
        let mut m = self.shared.msg_from_pool();
        m.payload.extend_from_slice(payload);
        m.to = to;
        m.rsp = rsp;

        let (send_n, ack_n);
        {
            let mut q = self.shared.queues.lock().unwrap();
            q.to_send.push_back(m);
            send_n = q.to_send.len();
            ack_n = q.awaiting.len();
        }
        let pool_n = self.shared.pool.lock().unwrap().len();
        self.shared.wake.notify_one();

        if pool_n > 20 || send_n > 10 || ack_n > 10 {
            warn!("unexpected many messages queued: {pool_n}/{send_n}/{ack_n}");
        }
        true
    }

    /// Match a frame received from the NFCC against awaiting-ack messages.
    ///
    /// A response releases the first command with the same (gid, oid) and
    /// yields its continuation, if any; a connection-credit notification
    /// releases the first data message on the credited connection and keeps
    /// flowing to the stack.
    pub fn acknowledge(&self, frame: &[u8]) -> Option<RspHook> {
        if frame.len() < 2 {
            return None;
        }
        match message_type(frame) {
            MT_RSP => {
                let gid = frame[0] & GID_MASK;
                let oid = frame[1] & OID_MASK;
                let mut q = self.shared.queues.lock().unwrap();
                let at = q.awaiting.iter().position(|m| {
                    m.payload.len() >= 2
                        && message_type(&m.payload) == MT_CMD
                        && m.payload[0] & GID_MASK == gid
                        && m.payload[1] & OID_MASK == oid
                });
                let m = at.and_then(|i| q.awaiting.remove(i));
                drop(q);
                m.and_then(|m| {
                    let hook = m.rsp;
                    self.shared.recycle(m);
                    hook
                })
            }
            MT_NTF => {
                if frame[0] & GID_MASK == GID_CORE
                    && frame[1] & OID_MASK == CORE_CONN_CREDITS
                {
                    // One connection entry at a time from this firmware.
                    if frame.len() == 6 {
                        let conn_id = frame[4];
                        let mut q = self.shared.queues.lock().unwrap();
                        let at = q.awaiting.iter().position(|m| {
                            message_type(&m.payload) == MT_DATA
                                && m.payload[0] & GID_MASK == conn_id
                        });
                        let m = at.and_then(|i| q.awaiting.remove(i));
                        drop(q);
                        if let Some(m) = m {
                            self.shared.recycle(m);
                        }
                    } else {
                        error!("unexpected CORE_CONN_CREDITS message data");
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Arm a watchdog; on expiry an abnormal CORE_RESET_NTF goes to the stack.
    pub fn watchdog_add(&self, kind: WatchdogKind, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        {
            let mut q = self.shared.queues.lock().unwrap();
            let at = q.watchdogs.partition_point(|w| w.deadline <= deadline);
            q.watchdogs.insert(at, Watchdog { kind, deadline });
        }
        self.shared.wake.notify_one();
        true
    }

    /// Clear all watchdogs of this kind.
    pub fn watchdog_remove(&self, kind: WatchdogKind) {
        let mut q = self.shared.queues.lock().unwrap();
        q.watchdogs.retain(|w| w.kind != kind);
    }

    /// Stop and join the worker, then release everything still queued.
    pub fn shutdown(&self) {
        {
            let mut q = self.shared.queues.lock().unwrap();
            q.must_exit = true;
        }
        self.shared.wake.notify_one();
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("failed to join the pump worker");
            }
        }

        let mut q = self.shared.queues.lock().unwrap();
        for m in q.to_send.drain(..) {
            debug!("drop outgoing msg: {:02x?}", &m.payload[..m.payload.len().min(3)]);
        }
        for m in q.awaiting.drain(..) {
            debug!("drop un-acked sent msg: {:02x?}", &m.payload[..m.payload.len().min(3)]);
        }
        q.watchdogs.clear();
        drop(q);
        self.shared.pool.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn queue_depths(&self) -> (usize, usize) {
        let q = self.shared.queues.lock().unwrap();
        (q.to_send.len(), q.awaiting.len())
    }
}

async fn run(shared: Arc<Shared>) {
    debug!("pump starting");
    loop {
        let wake = shared.wake.notified();
        tokio::pin!(wake);
        match pass(&shared) {
            Step::Exit => break,
            Step::Again => {}
            Step::PollSoon => sleep(Duration::from_millis(1)).await,
            Step::WaitUntil(deadline) => {
                select! {
                    _ = &mut wake => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            Step::Wait => wake.as_mut().await,
        }
    }
    debug!("pump exiting");
}

/// One scheduling pass: transmit what the in-flight constraints allow,
/// retransmit or abandon stale messages, fire expired watchdogs, then report
/// how to wait. The queue lock is dropped around every to-stack delivery so
/// the receiver may re-enter the library.
fn pass(shared: &Shared) -> Step {
    let mut updated = false;
    let mut q = shared.queues.lock().unwrap();
    let send_len_at_start = q.to_send.len();

    // At most one command and one data frame may be in flight.
    let mut skip_cmd = q.awaiting.iter().any(|m| message_type(&m.payload) == MT_CMD);
    let mut skip_data = q.awaiting.iter().any(|m| message_type(&m.payload) == MT_DATA);

    loop {
        let at = q.to_send.iter().position(|m| {
            let mt = message_type(&m.payload);
            !(m.to == Endpoint::Nfcc
                && ((skip_cmd && mt == MT_CMD) || (skip_data && mt == MT_DATA)))
        });
        let Some(at) = at else { break };
        let Some(mut m) = q.to_send.remove(at) else { break };
        updated = true;
        match m.to {
            Endpoint::Nfcc => {
                (shared.out)(Endpoint::Nfcc, &m.payload);
                match message_type(&m.payload) {
                    MT_CMD => skip_cmd = true,
                    MT_DATA => skip_data = true,
                    _ => {}
                }
                m.sent_at = Instant::now();
                q.awaiting.push_back(m);
            }
            Endpoint::Stack => {
                drop(q);
                (shared.out)(Endpoint::Stack, &m.payload);
                shared.recycle(m);
                q = shared.queues.lock().unwrap();
            }
        }
    }

    // Is the oldest unacknowledged message overdue?
    if q.awaiting.front().is_some_and(|m| m.sent_at.elapsed() >= DELAY_FOR_ACK) {
        updated = true;
        if let Some(mut m) = q.awaiting.pop_front() {
            let hdr: [u8; 3] = [
                m.payload.first().copied().unwrap_or(0),
                m.payload.get(1).copied().unwrap_or(0),
                m.payload.get(2).copied().unwrap_or(0),
            ];
            if !m.retried {
                debug!("message was not acked (once): {hdr:02x?}, resend");
                m.retried = true;
                q.to_send.push_front(m);
                return Step::Again;
            }
            debug!("message was not acked (twice): {hdr:02x?}, emulate CORE_RESET_NTF");
            if message_type(&m.payload) == MT_DATA {
                // A lost command is recovered by the stack's own timeout; a
                // lost data frame would hang it, so force a restart.
                drop(q);
                (shared.out)(Endpoint::Stack, &ABNORMAL_CORE_RESET_NTF);
                q = shared.queues.lock().unwrap();
            }
            shared.recycle(m);
        }
    }

    // Is a watchdog expiring?
    if q.watchdogs.first().is_some_and(|w| w.deadline <= Instant::now()) {
        updated = true;
        let w = q.watchdogs.remove(0);
        error!("watchdog {:?} expired, generating CORE_RESET_NTF", w.kind);
        drop(q);
        (shared.out)(Endpoint::Stack, &ABNORMAL_CORE_RESET_NTF);
        q = shared.queues.lock().unwrap();
    }

    if q.must_exit {
        // Stop order came while we were sending.
        return Step::Exit;
    }

    if !q.to_send.is_empty() {
        if !updated && q.to_send.len() == send_len_at_start {
            // Everything left is blocked behind an in-flight message.
            return Step::PollSoon;
        }
        return Step::Again;
    }

    let mut deadline = q.awaiting.front().map(|m| m.sent_at + DELAY_FOR_ACK);
    if let Some(w) = q.watchdogs.first() {
        deadline = Some(match deadline {
            Some(d) if d < w.deadline => d,
            _ => w.deadline,
        });
    }
    match deadline {
        Some(d) => Step::WaitUntil(d),
        None => Step::Wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    fn capture() -> (Pump, mpsc::Receiver<(Endpoint, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let out: OutboundFn = Arc::new(move |to, frame: &[u8]| {
            tx.lock().unwrap().send((to, frame.to_vec())).ok();
        });
        (Pump::new(out).unwrap(), rx)
    }

    fn recv(rx: &mpsc::Receiver<(Endpoint, Vec<u8>)>, ms: u64) -> (Endpoint, Vec<u8>) {
        rx.recv_timeout(StdDuration::from_millis(ms)).expect("no outbound frame")
    }

    #[test]
    fn response_releases_the_matching_command() {
        let (pump, rx) = capture();
        assert!(pump.post(Endpoint::Nfcc, &[0x21, 0x17, 0x00], Some(RspHook::ObserveGet)));
        let (to, frame) = recv(&rx, 500);
        assert_eq!(to, Endpoint::Nfcc);
        assert_eq!(frame, vec![0x21, 0x17, 0x00]);

        // A response for another opcode does not match.
        assert_eq!(pump.acknowledge(&[0x41, 0x03, 0x01, 0x00]), None);
        assert_eq!(pump.queue_depths().1, 1);

        assert_eq!(
            pump.acknowledge(&[0x41, 0x17, 0x02, 0x00, 0x03]),
            Some(RspHook::ObserveGet)
        );
        assert_eq!(pump.queue_depths(), (0, 0));
        pump.shutdown();
    }

    #[test]
    fn credit_releases_the_matching_data() {
        let (pump, rx) = capture();
        assert!(pump.post(Endpoint::Nfcc, &[0x00, 0x00, 0x01, 0xAA], None));
        recv(&rx, 500);
        assert_eq!(pump.queue_depths().1, 1);

        // Credit for another connection is ignored.
        pump.acknowledge(&[0x60, 0x06, 0x03, 0x01, 0x01, 0x01]);
        assert_eq!(pump.queue_depths().1, 1);

        pump.acknowledge(&[0x60, 0x06, 0x03, 0x01, 0x00, 0x01]);
        assert_eq!(pump.queue_depths(), (0, 0));
        pump.shutdown();
    }

    #[test]
    fn second_command_waits_for_the_first_ack() {
        let (pump, rx) = capture();
        pump.post(Endpoint::Nfcc, &[0x20, 0x02, 0x01, 0x00], None);
        pump.post(Endpoint::Nfcc, &[0x21, 0x06, 0x01, 0x00], None);
        let (_, first) = recv(&rx, 500);
        assert_eq!(first[..2], [0x20, 0x02]);
        // The second command must not go out until the first is acknowledged.
        assert!(rx.recv_timeout(StdDuration::from_millis(100)).is_err());
        pump.acknowledge(&[0x40, 0x02, 0x01, 0x00]);
        let (_, second) = recv(&rx, 500);
        assert_eq!(second[..2], [0x21, 0x06]);
        pump.shutdown();
    }

    #[test]
    fn to_stack_messages_are_not_held_back() {
        let (pump, rx) = capture();
        pump.post(Endpoint::Nfcc, &[0x20, 0x02, 0x01, 0x00], None);
        recv(&rx, 500);
        pump.post(Endpoint::Stack, &[0x4F, 0x0C, 0x01, 0x00], None);
        let (to, frame) = recv(&rx, 500);
        assert_eq!(to, Endpoint::Stack);
        assert_eq!(frame[..2], [0x4F, 0x0C]);
        pump.shutdown();
    }

    #[test]
    fn watchdog_fires_once_and_can_be_removed() {
        let (pump, rx) = capture();
        pump.watchdog_add(WatchdogKind::ActiveRwTooLong, 50);
        let (to, frame) = recv(&rx, 2000);
        assert_eq!(to, Endpoint::Stack);
        assert_eq!(frame, ABNORMAL_CORE_RESET_NTF.to_vec());
        assert!(rx.recv_timeout(StdDuration::from_millis(150)).is_err());

        pump.watchdog_add(WatchdogKind::FieldOnTooLong, 100);
        pump.watchdog_remove(WatchdogKind::FieldOnTooLong);
        assert!(rx.recv_timeout(StdDuration::from_millis(300)).is_err());
        pump.shutdown();
    }

    #[test]
    fn oversized_message_is_refused() {
        let (pump, _rx) = capture();
        let oversized = vec![0u8; MAX_MSG_LEN + 1];
        assert!(!pump.post(Endpoint::Nfcc, &oversized, None));
        pump.shutdown();
    }

    #[test]
    fn shutdown_empties_every_queue() {
        let (pump, rx) = capture();
        pump.post(Endpoint::Nfcc, &[0x20, 0x00, 0x01, 0x00], None);
        recv(&rx, 500);
        pump.post(Endpoint::Nfcc, &[0x21, 0x03, 0x01, 0x00], None);
        pump.watchdog_add(WatchdogKind::FieldOnTooLong, 60_000);
        pump.shutdown();
        assert_eq!(pump.queue_depths(), (0, 0));
    }
}
