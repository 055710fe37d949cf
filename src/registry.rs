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

//! Sub-module interceptors. A closed set of hook identities is matched
//! against (mt, gid, oid, sub-opcode) before the regular dispatchers run.

use log::error;
use std::sync::Mutex;

use crate::packets::{GID_PROP, MT_CMD, MT_NTF};
use crate::vendor::{OID_ANDROID, OID_FW_PROP, OID_FW_TEST};

/// Frame interceptors that sub-modules can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hook {
    /// Collect HCI fragments on the HCI connection until a frame completes.
    HciReassembly,
    /// Swallow observe-mode suspend/resume notifications once the stack has
    /// negotiated exit-frame support (it learns of suspension by other means).
    ObserveSuspendGate,
    /// Turn firmware polling logs into polling-frame notifications.
    PollingFrame,
}

/// Continuations attached to commands this library sends to the NFCC; run
/// when the matching response is pulled out of the awaiting-ack queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RspHook {
    /// Forward the response to the stack unchanged.
    Passthrough,
    /// Swallow the response of a command synthesized here.
    Block,
    ObserveGet,
    ObserveSetConfig,
    ObserveSetTech,
    ExitFrame,
    AnnotationPoll,
    CustomPollFrame,
    ApduInfo,
    EseDisable,
    EseReset,
    #[cfg(feature = "uid-sak")]
    UidSakStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Matcher {
    pub hook: Hook,
    pub mt: Option<u8>,
    pub gid: Option<u8>,
    pub oid: Option<u8>,
    pub suboid: Option<u8>,
}

impl Matcher {
    fn matches(&self, mt: u8, gid: u8, oid: u8, suboid: u8) -> bool {
        self.mt.map_or(true, |v| v == mt)
            && self.gid.map_or(true, |v| v == gid)
            && self.oid.map_or(true, |v| v == oid)
            && self.suboid.map_or(true, |v| v == suboid)
    }
}

const MAX_DISPATCH: usize = 10;

pub(crate) struct Registry {
    entries: Mutex<Vec<Matcher>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { entries: Mutex::new(Vec::new()) }
    }

    /// Install an interceptor. Registering the exact same matcher twice is a
    /// no-op so capability negotiation can be repeated safely.
    pub fn register(&self, m: Matcher) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains(&m) {
            entries.push(m);
        }
        true
    }

    /// Remove the first entry installed for `hook`.
    pub fn unregister(&self, hook: Hook) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(at) = entries.iter().position(|e| e.hook == hook) {
            entries.remove(at);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Snapshot the hooks matching this frame. The lock is not held while the
    /// hooks run, so a hook may re-enter the registry.
    pub fn matches(&self, mt: u8, gid: u8, oid: u8, frame: &[u8]) -> Vec<Hook> {
        let suboid = sub_opcode(mt, gid, oid, frame);
        let entries = self.entries.lock().unwrap();
        let mut hooks = Vec::new();
        for e in entries.iter() {
            if e.matches(mt, gid, oid, suboid) {
                if hooks.len() == MAX_DISPATCH {
                    error!("too many callbacks may match, discarding some");
                    break;
                }
                hooks.push(e.hook);
            }
        }
        hooks
    }
}

/// Derive the sub-opcode byte used for matching on the vendor group.
fn sub_opcode(mt: u8, gid: u8, oid: u8, frame: &[u8]) -> u8 {
    if gid != GID_PROP {
        return 0;
    }
    match oid {
        OID_FW_PROP | OID_FW_TEST => match mt {
            MT_CMD => frame.get(3).copied().unwrap_or(0),
            // A status byte precedes the sub-opcode in notifications.
            MT_NTF => frame.get(4).copied().unwrap_or(0),
            // Responses carry no sub-opcode.
            _ => 0,
        },
        OID_ANDROID => frame.get(3).copied().unwrap_or(0),
        // Loader and power-monitor frames have their own formats, no sub-opcode.
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::MT_DATA;

    fn gate(oid: u8) -> Matcher {
        Matcher {
            hook: Hook::ObserveSuspendGate,
            mt: Some(MT_NTF),
            gid: Some(GID_PROP),
            oid: Some(oid),
            suboid: None,
        }
    }

    #[test]
    fn wildcard_fields_do_not_participate() {
        let r = Registry::new();
        assert!(r.register(Matcher {
            hook: Hook::HciReassembly,
            mt: Some(MT_DATA),
            gid: Some(0x01),
            oid: None,
            suboid: None,
        }));
        assert_eq!(r.matches(MT_DATA, 0x01, 0x3F, &[]), vec![Hook::HciReassembly]);
        assert!(r.matches(MT_DATA, 0x00, 0x00, &[]).is_empty());
        assert!(r.matches(MT_CMD, 0x01, 0x00, &[]).is_empty());
    }

    #[test]
    fn suboid_comes_from_the_right_offset() {
        let r = Registry::new();
        r.register(Matcher {
            hook: Hook::PollingFrame,
            mt: Some(MT_NTF),
            gid: Some(GID_PROP),
            oid: Some(OID_FW_PROP),
            suboid: Some(0x20),
        });
        // Notification: status at 3, sub-opcode at 4.
        let ntf = [0x6F, 0x02, 0x03, 0x00, 0x20, 0x00];
        assert_eq!(
            r.matches(MT_NTF, GID_PROP, OID_FW_PROP, &ntf),
            vec![Hook::PollingFrame]
        );
        // The status byte is not the sub-opcode.
        let other = [0x6F, 0x02, 0x03, 0x20, 0x00, 0x00];
        assert!(r.matches(MT_NTF, GID_PROP, OID_FW_PROP, &other).is_empty());
    }

    #[test]
    fn unregister_removes_one_entry_at_a_time() {
        let r = Registry::new();
        r.register(gate(0x1B));
        r.register(gate(0x1C));
        r.unregister(Hook::ObserveSuspendGate);
        let left = r.matches(MT_NTF, GID_PROP, 0x1C, &[]);
        assert_eq!(left, vec![Hook::ObserveSuspendGate]);
        assert!(r.matches(MT_NTF, GID_PROP, 0x1B, &[]).is_empty());
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let r = Registry::new();
        r.register(gate(0x1B));
        r.register(gate(0x1B));
        r.unregister(Hook::ObserveSuspendGate);
        assert!(r.matches(MT_NTF, GID_PROP, 0x1B, &[]).is_empty());
    }
}
