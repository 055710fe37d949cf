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

//! Mutable processor state, owned by one `NciShim` instance and guarded by
//! the re-entry lock for its whole lifetime.

use log::{debug, error, info};
use std::time::Instant;

use crate::vendor::HciHook;

/// Controller operating mode, learned from CORE_RESET_NTF triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ClfMode {
    #[default]
    Unknown,
    Loader,
    RouterDisabled,
    RouterEnabled,
    RouterUsbCharging,
}

/// Hardware families, first byte of the manufacturer specific info.
pub(crate) const HW_FAMILY_OLDEST: u8 = 0x04;
pub(crate) const HW_FAMILY_MIDDLE: u8 = 0x05;
pub(crate) const HW_FAMILY_NEWEST_A: u8 = 0x06;
pub(crate) const HW_FAMILY_NEWEST_B: u8 = 0x07;

const MANUFACTURER_ID: u8 = 0x02;
const MAX_MANU_INFO: usize = 40;
pub(crate) const MAX_HCI_RECEIVE: usize = 1024;
const MAX_NFCEES: usize = 5;

/// Per-NFCEE listen protocol masks folded from RF_NFCEE_DISCOVERY_REQ_NTF.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EeInfo {
    pub nfcee_id: u8,
    pub listen_a: u8,
    pub listen_b: u8,
    pub listen_f: u8,
}

pub(crate) const PROTO_MASK_T2T: u8 = 0x01;
pub(crate) const PROTO_MASK_T3T: u8 = 0x02;
pub(crate) const PROTO_MASK_T4T: u8 = 0x04;

/// Secure element liveness tracking fed by SWP firmware logs.
#[derive(Debug, Default)]
pub(crate) struct EseMonitor {
    pub stuck: bool,
    pub last_tx: [u8; 5],
    pub last_tx_len: usize,
    pub last_tx_count: u32,
    pub last_rx_param: [u8; 30],
    pub last_rx_param_len: usize,
    pub last_rx_is_frag: [bool; 4],
}

impl EseMonitor {
    pub fn clear(&mut self) {
        if self.last_rx_param_len != 0 {
            debug!("clear saved param on deact");
        }
        self.last_tx_count = 0;
        self.last_tx_len = 0;
        self.last_rx_param_len = 0;
        self.last_rx_is_frag = [false; 4];
    }
}

/// Two-step UID/SAK configuration exchange.
#[cfg(feature = "uid-sak")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum UidSakStep {
    #[default]
    GetConfig,
    SetConfig,
}

/// Settings sourced from the HAL configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Arm a recovery watchdog when the remote field stays on too long.
    pub field_timer: bool,
    /// Arm a recovery watchdog when an active read/write outlives screen off.
    pub activerw_timer: bool,
    /// 0: quiet; 1: important frames; 2: every frame.
    pub trace_level: u8,
}

#[derive(Default)]
pub(crate) struct State {
    pub passthrough: bool,
    pub clf_mode: ClfMode,

    // Chip identity from the last CORE_RESET_NTF (empty until received).
    pub manu_info: Vec<u8>,

    // Observe mode.
    pub observe_per_tech: bool,
    pub observe_suspended: bool,

    // Polling frame synthesis.
    pub polling_in_ce: bool,

    // Power monitor.
    pub pwr_mon_active_rw: bool,
    pub pwr_mon_errors: u32,

    // NFCEE tracking.
    pub active_nfcees: Vec<u8>,
    pub wait_nfcee_ntf: bool,
    pub waiting_nfcee_id: u8,

    // APDU gate.
    pub apdu_gate_ready: bool,
    pub apdu_pipe_id: u8,
    pub tx_waiting_time: u32,

    // HCI reassembly.
    pub hci_rsp: Option<HciHook>,
    pub hci_buf: Vec<u8>,
    pub hci_lent_credits: u8,

    // Deactivation pacing.
    pub last_rf_tx: Option<Instant>,

    pub ee_info: Vec<EeInfo>,

    // UID/SAK exchange.
    #[cfg(feature = "uid-sak")]
    pub uid_sak_step: UidSakStep,
    #[cfg(feature = "uid-sak")]
    pub uid: [u8; 10],
    #[cfg(feature = "uid-sak")]
    pub uid_len: usize,
    #[cfg(feature = "uid-sak")]
    pub sak: u8,
    pub is_card_a_on: bool,

    // Reader activation / empty I-frame suppression.
    pub is_reader_activation: bool,
    pub tx_empty_iframe: bool,

    pub ese_felica_enabled: bool,

    // Custom polling.
    pub cust_poll_frame_set: bool,
    pub rf_intf_cust_tx: bool,

    pub ese: EseMonitor,

    pub settings: Settings,
}

impl State {
    pub fn new(trace_level: u8) -> Self {
        State {
            settings: Settings { trace_level, ..Default::default() },
            ..Default::default()
        }
    }

    pub fn hw_version(&self) -> u8 {
        self.manu_info.first().copied().unwrap_or(0)
    }

    pub fn fw_major(&self) -> u8 {
        self.manu_info.get(2).copied().unwrap_or(0)
    }

    pub fn fw_minor(&self) -> u8 {
        self.manu_info.get(3).copied().unwrap_or(0) & 0x7F
    }

    pub fn is_newest_family(&self) -> bool {
        matches!(self.hw_version(), HW_FAMILY_NEWEST_A | HW_FAMILY_NEWEST_B)
    }

    /// Firmware generation, 0 when the chip/firmware pair is not recognized.
    pub fn fw_generation(&self) -> u8 {
        let hw = self.hw_version();
        let major = self.fw_major();
        if self.is_newest_family() && major == 0x02 {
            3
        } else if (hw == HW_FAMILY_OLDEST && major == 0x13)
            || (hw == HW_FAMILY_MIDDLE && major == 0x03)
        {
            2
        } else if (hw == HW_FAMILY_OLDEST && major == 0x01)
            || (hw == HW_FAMILY_MIDDLE && (major == 0x01 || major == 0x02))
            || (self.is_newest_family() && major == 0x01)
        {
            1
        } else {
            0
        }
    }

    /// Record chip identity and operating mode from a CORE_RESET_NTF.
    pub fn record_core_reset(&mut self, frame: &[u8]) {
        if frame.len() <= 8 {
            error!("CORE_RESET_NTF length too short: {}", frame.len());
            return;
        }
        let trigger = frame[3];
        let manuf_id = frame[6];
        let manuf_len = frame[7] as usize;
        if manuf_id != MANUFACTURER_ID {
            error!("CORE_RESET_NTF ignored, unexpected manufacturer: {manuf_id:#04x}");
            return;
        }

        match trigger {
            // Unrecoverable error; may be a forged recovery frame, ignore it.
            0x00 => {}
            0xA0 => {
                match frame.get(7 + manuf_len) {
                    Some(&0x00) => self.clf_mode = ClfMode::RouterDisabled,
                    Some(&0x01) => self.clf_mode = ClfMode::RouterEnabled,
                    Some(&0x02) => self.clf_mode = ClfMode::RouterUsbCharging,
                    other => error!("unexpected mode byte: {other:?}"),
                }
                debug!("controller mode: {:?}", self.clf_mode);
                self.capture_identity(frame, manuf_len);
            }
            // End of boot, or after a CORE_RESET_CMD.
            0x01 | 0x02 => self.capture_identity(frame, manuf_len),
            0xA2 => {
                self.clf_mode = ClfMode::Loader;
                debug!("controller mode: {:?}", self.clf_mode);
            }
            other => error!("unexpected trigger: {other:#04x}"),
        }
    }

    fn capture_identity(&mut self, frame: &[u8], manuf_len: usize) {
        let take = manuf_len.min(MAX_MANU_INFO).min(frame.len() - 8);
        self.manu_info.clear();
        self.manu_info.extend_from_slice(&frame[8..8 + take]);
        info!(
            "chip identity: hw {:#04x}, fw {}.{}",
            self.hw_version(),
            self.fw_major(),
            self.fw_minor()
        );
    }

    /// Track an NFCEE activation/deactivation result.
    pub fn nfcee_mode_set_result(&mut self) {
        if self.wait_nfcee_ntf {
            if self.active_nfcees.len() < MAX_NFCEES {
                self.active_nfcees.push(self.waiting_nfcee_id);
            }
        } else {
            let id = self.waiting_nfcee_id;
            self.active_nfcees.retain(|&e| e != id);
        }
    }

    /// Fold one discovery-request entry into the per-NFCEE protocol masks.
    pub fn fold_ee_discovery(&mut self, op_add: bool, nfcee_id: u8, tech: u8, protocol: u8) {
        use crate::packets::{
            DISCOVERY_TYPE_LISTEN_A, DISCOVERY_TYPE_LISTEN_B, DISCOVERY_TYPE_LISTEN_F,
            PROTOCOL_ISO_DEP, PROTOCOL_T2T,
        };

        let idx = match self.ee_info.iter().position(|e| e.nfcee_id == nfcee_id) {
            Some(i) => i,
            None => {
                if self.ee_info.len() >= MAX_NFCEES {
                    error!("too many NFCEEs in discovery requests, ignoring {nfcee_id:#04x}");
                    return;
                }
                self.ee_info.push(EeInfo { nfcee_id, ..Default::default() });
                self.ee_info.len() - 1
            }
        };
        let entry = &mut self.ee_info[idx];
        let apply = |mask: &mut u8, bit: u8| {
            if op_add {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
        };
        match tech {
            DISCOVERY_TYPE_LISTEN_A => {
                if protocol == PROTOCOL_T2T {
                    apply(&mut entry.listen_a, PROTO_MASK_T2T);
                } else if protocol == PROTOCOL_ISO_DEP {
                    apply(&mut entry.listen_a, PROTO_MASK_T4T);
                }
            }
            DISCOVERY_TYPE_LISTEN_B => apply(&mut entry.listen_b, PROTO_MASK_T4T),
            DISCOVERY_TYPE_LISTEN_F => apply(&mut entry.listen_f, PROTO_MASK_T3T),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{PROTOCOL_ISO_DEP, PROTOCOL_T2T};

    fn reset_ntf(info: &[u8]) -> Vec<u8> {
        let mut f = vec![0x60, 0x00, 0x00, 0x01, 0x01, 0x20, 0x02, info.len() as u8];
        f.extend_from_slice(info);
        f[2] = (f.len() - 3) as u8;
        f
    }

    #[test]
    fn generation_ladder() {
        let mut s = State::default();
        assert_eq!(s.fw_generation(), 0);

        s.record_core_reset(&reset_ntf(&[0x04, 0x00, 0x01, 0x00, 0x00, 0x01]));
        assert_eq!(s.fw_generation(), 1);

        s.record_core_reset(&reset_ntf(&[0x04, 0x00, 0x13, 0x01, 0x00, 0x01]));
        assert_eq!(s.fw_generation(), 2);

        s.record_core_reset(&reset_ntf(&[0x05, 0x00, 0x03, 0x01, 0x00, 0x01]));
        assert_eq!(s.fw_generation(), 2);

        s.record_core_reset(&reset_ntf(&[0x06, 0x00, 0x02, 0x06, 0x00, 0x01]));
        assert_eq!(s.fw_generation(), 3);
        assert!(s.is_newest_family());

        s.record_core_reset(&reset_ntf(&[0x05, 0x00, 0x09, 0x00, 0x00, 0x01]));
        assert_eq!(s.fw_generation(), 0);
    }

    #[test]
    fn minor_version_masks_high_bit() {
        let mut s = State::default();
        s.record_core_reset(&reset_ntf(&[0x06, 0x00, 0x02, 0x86, 0x00, 0x01]));
        assert_eq!(s.fw_minor(), 0x06);
    }

    #[test]
    fn foreign_manufacturer_is_ignored() {
        let mut s = State::default();
        let mut f = reset_ntf(&[0x06, 0x00, 0x02, 0x06, 0x00, 0x01]);
        f[6] = 0x05;
        s.record_core_reset(&f);
        assert!(s.manu_info.is_empty());
    }

    #[test]
    fn mode_trigger_sets_clf_mode_and_identity() {
        let mut s = State::default();
        // The mode byte rides as the last byte of the manufacturer info.
        let mut f = reset_ntf(&[0x06, 0x00, 0x02, 0x06, 0x00, 0x01]);
        f[3] = 0xA0;
        s.record_core_reset(&f);
        assert_eq!(s.clf_mode, ClfMode::RouterEnabled);
        assert_eq!(s.hw_version(), 0x06);

        f[3] = 0xA2;
        s.record_core_reset(&f);
        assert_eq!(s.clf_mode, ClfMode::Loader);
    }

    #[test]
    fn ee_discovery_masks_fold_and_unfold() {
        let mut s = State::default();
        s.fold_ee_discovery(true, 0x86, 0x80, PROTOCOL_T2T);
        s.fold_ee_discovery(true, 0x86, 0x80, PROTOCOL_ISO_DEP);
        s.fold_ee_discovery(true, 0x86, 0x82, 0x03);
        assert_eq!(s.ee_info.len(), 1);
        assert_eq!(s.ee_info[0].listen_a, PROTO_MASK_T2T | PROTO_MASK_T4T);
        assert_eq!(s.ee_info[0].listen_f, PROTO_MASK_T3T);
        s.fold_ee_discovery(false, 0x86, 0x80, PROTOCOL_T2T);
        assert_eq!(s.ee_info[0].listen_a, PROTO_MASK_T4T);
    }
}
