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

//! In-line NCI message processor.
//!
//! The shim sits between an NFC stack and the controller and is transparent
//! by default: every frame offered to [`NciShim::process`] flows through
//! untouched unless one of the interception rules rewrites, synthesizes,
//! absorbs or delays it. The rules bridge the Android NCI command family to
//! the vendor command set, enforce timing and liveness invariants the
//! firmware cannot guarantee alone, and detect secure-element misbehavior.
//!
//! The embedder supplies one outbound callback; frames it receives with
//! [`Endpoint::Nfcc`] go down to the controller, frames with
//! [`Endpoint::Stack`] go up. The callback may be invoked from the caller's
//! thread or from the internal pump worker.

use log::{debug, error, info};
use std::sync::{Arc, Mutex};
use thiserror::Error;

mod android;
mod crc;
mod packets;
mod pump;
mod registry;
mod standard;
mod state;
mod vendor;

use packets::{parse_header, FrameBuilder, Header, GID_PROP, MT_CMD, MT_DATA};
use pump::{OutboundFn, Pump};
use registry::{Hook, Registry, RspHook};
use state::State;
use vendor::{OID_ANDROID, OID_LIB, SUB_SET_PASSTHROUGH};

pub use state::Settings;

/// One side of the NCI link. Used both for where a frame came from and for
/// where an outbound frame must be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The platform NFC stack above this library.
    Stack,
    /// The NFC controller below it.
    Nfcc,
}

impl Endpoint {
    fn opposite(self) -> Endpoint {
        match self {
            Endpoint::Stack => Endpoint::Nfcc,
            Endpoint::Nfcc => Endpoint::Stack,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The pump worker thread or its runtime could not be created.
    #[error("failed to start the pump worker: {0}")]
    PumpStart(#[from] std::io::Error),
}

/// Everything a dispatcher rule may need: the state behind the re-entry
/// lock, the pump for posting frames, and the interceptor registry.
pub(crate) struct Ctx<'a> {
    pub state: &'a mut State,
    pub pump: &'a Pump,
    pub registry: &'a Registry,
}

/// One message-processor instance.
///
/// Dropping the shim stops the pump worker and releases every queued
/// message; constructing a new instance starts from empty state.
pub struct NciShim {
    state: Mutex<State>,
    pump: Pump,
    registry: Registry,
}

impl NciShim {
    /// Create a processor and install the outbound callback.
    pub fn new<F>(trace_level: u8, outbound: F) -> Result<NciShim, Error>
    where
        F: Fn(Endpoint, &[u8]) + Send + Sync + 'static,
    {
        info!(
            "initializing (lib version {:#06x}), trace level {trace_level}",
            vendor::LIB_VERSION
        );
        let out: OutboundFn = Arc::new(outbound);
        Ok(NciShim {
            state: Mutex::new(State::new(trace_level)),
            pump: Pump::new(out)?,
            registry: Registry::new(),
        })
    }

    /// Update the frame-dump verbosity.
    pub fn set_trace_level(&self, level: u8) {
        self.state.lock().unwrap().settings.trace_level = level;
    }

    /// Store the settings sourced from the configuration file.
    pub fn configure(&self, settings: Settings) {
        self.state.lock().unwrap().settings = settings;
    }

    /// Ask the remote side of the link (an older in-line processor below
    /// this one) to stop interfering; its response is consumed here.
    pub fn set_passthrough(&self) {
        let _guard = self.state.lock().unwrap();
        let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_LIB);
        b.u8(SUB_SET_PASSTHROUGH);
        b.u8(0x01);
        let _ = self.pump.post(Endpoint::Nfcc, &b.finish(), Some(RspHook::Block));
    }

    /// Process one NCI frame.
    ///
    /// Returns `true` when the frame was consumed (the caller must discard
    /// it; any forwarding happens through the outbound callback) and `false`
    /// when the caller must forward it itself.
    pub fn process(&self, from: Endpoint, frame: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        if !state.passthrough && state.settings.trace_level > 1 {
            debug!("processing {:02x?}", &frame[..frame.len().min(4)]);
        }

        let mut handled = false;
        if from == Endpoint::Nfcc {
            // The pump goes first, in case this acknowledges a sent message.
            if let Some(hook) = self.pump.acknowledge(frame) {
                let mut ctx =
                    Ctx { state: &mut *state, pump: &self.pump, registry: &self.registry };
                handled = run_rsp_hook(hook, &mut ctx, frame);
            }
        }

        if !handled {
            let hdr = match parse_header(frame) {
                Ok(hdr) => hdr,
                Err(e) => {
                    error!("frame not parseable, not handled: {e}");
                    return false;
                }
            };

            if state.passthrough && !is_passthrough_toggle(&hdr, frame) {
                // Keep the ack and credit bookkeeping alive for logging, but
                // let the embedder forward stack traffic itself.
                if from == Endpoint::Nfcc {
                    handled = self.pump.post(Endpoint::Stack, frame, None);
                }
                return handled;
            }

            let mut ctx = Ctx { state: &mut *state, pump: &self.pump, registry: &self.registry };
            for hook in self.registry.matches(hdr.mt, hdr.gid, hdr.oid, frame) {
                if run_hook(hook, &mut ctx, frame, &hdr) {
                    handled = true;
                    break;
                }
            }

            if !handled {
                handled = dispatch(&mut ctx, false, from, frame, &hdr);
            }
        }

        if !handled {
            // Nobody consumed it; forward through the pump so transmit
            // ordering and ack tracking still apply.
            handled = self.pump.post(from.opposite(), frame, None);
        }
        handled
    }

    /// Let the library observe a frame it must not act on. Only passive
    /// state updates happen, notably chip-identity capture from
    /// CORE_RESET_NTF.
    pub fn inform(&self, from: Endpoint, frame: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if state.passthrough {
            return;
        }
        if state.settings.trace_level > 1 {
            debug!("informed of {:02x?}", &frame[..frame.len().min(4)]);
        }
        let hdr = match parse_header(frame) {
            Ok(hdr) => hdr,
            Err(e) => {
                error!("ignoring frame: {e}");
                return;
            }
        };
        let mut ctx = Ctx { state, pump: &self.pump, registry: &self.registry };
        dispatch(&mut ctx, true, from, frame, &hdr);
    }
}

impl Drop for NciShim {
    fn drop(&mut self) {
        debug!("deinitializing");
        self.pump.shutdown();
        self.registry.clear();
    }
}

fn is_passthrough_toggle(hdr: &Header, frame: &[u8]) -> bool {
    hdr.mt == MT_CMD
        && hdr.gid == GID_PROP
        && hdr.oid == OID_LIB
        && frame.get(3) == Some(&SUB_SET_PASSTHROUGH)
}

/// Route a frame to the dispatcher owning its group.
fn dispatch(ctx: &mut Ctx, inform_only: bool, from: Endpoint, frame: &[u8], hdr: &Header) -> bool {
    if hdr.mt != MT_DATA && hdr.gid == GID_PROP {
        if hdr.oid == OID_ANDROID {
            android::process(ctx, inform_only, from, frame, hdr)
        } else if vendor::is_vendor_oid(hdr.oid) {
            vendor::process(ctx, inform_only, from, frame, hdr)
        } else {
            false
        }
    } else {
        standard::process(ctx, inform_only, from, frame, hdr)
    }
}

/// Run a registry interceptor.
fn run_hook(hook: Hook, ctx: &mut Ctx, frame: &[u8], hdr: &Header) -> bool {
    match hook {
        Hook::HciReassembly => vendor::hci_reassembly(ctx, frame),
        Hook::ObserveSuspendGate => android::observe_gate(hdr),
        Hook::PollingFrame => android::polling_frame(ctx, frame),
    }
}

/// Run the continuation of an acknowledged command.
fn run_rsp_hook(hook: RspHook, ctx: &mut Ctx, frame: &[u8]) -> bool {
    match hook {
        RspHook::Passthrough => ctx.pump.post(Endpoint::Stack, frame, None),
        RspHook::Block => true,
        RspHook::ObserveGet => android::observe_get_rsp(ctx, frame),
        RspHook::ObserveSetConfig => {
            android::observe_set_rsp(ctx, frame, android::SUB_PASSIVE_OBSERVE)
        }
        RspHook::ObserveSetTech => {
            android::observe_set_rsp(ctx, frame, android::SUB_SET_OBSERVER_TECH)
        }
        RspHook::ExitFrame => android::exit_frame_rsp(ctx, frame),
        RspHook::AnnotationPoll => android::annotation_rsp(ctx, frame),
        RspHook::CustomPollFrame => vendor::custom_poll_rsp(ctx, frame),
        RspHook::ApduInfo => vendor::apdu_info_rsp(ctx, frame),
        RspHook::EseDisable => vendor::ese_disable_rsp(ctx, frame),
        RspHook::EseReset => vendor::ese_reset_rsp(ctx, frame),
        #[cfg(feature = "uid-sak")]
        RspHook::UidSakStep => android::uid_sak_step(ctx, frame),
    }
}
