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

//! Vendor-group frame handling: the library's own extension commands, the
//! HCI-over-NCI plumbing for the APDU gate, power-monitor tracking,
//! firmware-log parsing and the secure-element stuck-frame detector.

use bytes::BytesMut;
use log::{debug, error, info};

use crate::crc::{crc_a, crc_b};
use crate::packets::*;
use crate::pump::WatchdogKind;
use crate::registry::{Hook, Matcher, RspHook};
use crate::standard::send_recovery;
use crate::state::MAX_HCI_RECEIVE;
use crate::{Ctx, Endpoint};

// b15..12: flavour; b11..0: version. Flavour 0: base stack.
pub(crate) const LIB_VERSION: u16 = 0x0001;

/// OID of this library's extension surface.
pub(crate) const OID_LIB: u8 = 0x01;
/// Vendor firmware OIDs.
pub(crate) const OID_FW_PROP: u8 = 0x02;
pub(crate) const OID_FW_TEST: u8 = 0x03;
pub(crate) const OID_FW_LOADER: u8 = 0x04;
pub(crate) const OID_PWR_MON_ON: u8 = 0x05;
pub(crate) const OID_PWR_MON_OFF: u8 = 0x06;
pub(crate) const OID_ANDROID: u8 = 0x0C;
pub(crate) const OID_SET_EXIT_FRAME: u8 = 0x19;
pub(crate) const OID_OBSERVE_SUSPENDED: u8 = 0x1B;
pub(crate) const OID_OBSERVE_RESUMED: u8 = 0x1C;
pub(crate) const OID_SET_CUST_POLL_FRAME: u8 = 0x1D;

/// Extension sub-opcodes on [`OID_LIB`].
pub(crate) const SUB_SET_PASSTHROUGH: u8 = 0x00;
pub(crate) const SUB_GET_LIB_VERSION: u8 = 0x01;
pub(crate) const SUB_GET_MANUF_DATA: u8 = 0x02;
pub(crate) const SUB_GET_NFCEE_ID_LIST: u8 = 0x03;
pub(crate) const SUB_SETUP_APDU_GATE: u8 = 0x04;
pub(crate) const SUB_TRANSCEIVE_APDU_GATE: u8 = 0x05;
pub(crate) const SUB_EE_ACTION_AID_WITH_SW: u8 = 0x06;
pub(crate) const SUB_EMULATE_NFC_A: u8 = 0x10;
pub(crate) const SUB_SET_FELICA_ENABLED: u8 = 0x12;
pub(crate) const SUB_SET_CUSTOM_POLL_FRAME: u8 = 0x13;
pub(crate) const SUB_ACTIVATED_CUSTOM_POLL: u8 = 0x14;

/// Firmware sub-opcodes on [`OID_FW_PROP`] / [`OID_FW_TEST`].
pub(crate) const SUB_FW_GET_CONFIG: u8 = 0x03;
#[cfg(feature = "uid-sak")]
pub(crate) const SUB_FW_SET_CONFIG: u8 = 0x04;
pub(crate) const SUB_FW_LOG: u8 = 0x20;
pub(crate) const SUB_TEST_RESET_SE: u8 = 0x01;
const GET_CONFIG_ESE_ATTR: u8 = 0x0B;

/// The secure element behind the SWP link.
pub(crate) const ESE_NFCEE_ID: u8 = 0x86;

// HCP message framing.
const HCP_TYPE_COMMAND: u8 = 0;
const HCP_TYPE_EVENT: u8 = 2;
const ANY_GET_PARAMETER: u8 = 0x02;
const ATR_REG_INDEX: u8 = 0x01;
const EVT_SE_SOFT_RESET: u8 = 0x11;
const EVT_TRANSMIT_DATA: u8 = 0x10;
const EVT_WTX_REQUEST: u8 = 0x11;

// Firmware log record types.
pub(crate) const FWLOG_CE_TX: u8 = 0x08;
pub(crate) const FWLOG_CE_RX: u8 = 0x09;
pub(crate) const FWLOG_ACTIVE_A: u8 = 0x0C;
pub(crate) const FWLOG_SLEEP_A: u8 = 0x0E;
pub(crate) const FWLOG_FIELD_ON: u8 = 0x10;
pub(crate) const FWLOG_FIELD_OFF: u8 = 0x11;
pub(crate) const FWLOG_FIELD_LEVEL: u8 = 0x18;
pub(crate) const FWLOG_CE_RX_ERROR: u8 = 0x19;
const FWLOG_TX_CTRL: u8 = 0x31;
const FWLOG_TX_IR: u8 = 0x33;
const FWLOG_RX_ACT: u8 = 0x35;
const FWLOG_RX_ERR: u8 = 0x38;
const FWLOG_SWP_DEACTIVATED: u8 = 0x3B;
pub(crate) const FWLOG_IDLE: u8 = 0x45;

/// Response continuations invoked on completed HCI frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HciHook {
    ApduGateAtr,
    ApduGateTransceive,
}

/// Vendor OIDs this library processes (the android opcode is routed apart).
pub(crate) fn is_vendor_oid(oid: u8) -> bool {
    matches!(
        oid,
        OID_LIB
            | OID_FW_PROP
            | OID_FW_TEST
            | OID_FW_LOADER
            | OID_PWR_MON_ON
            | OID_PWR_MON_OFF
            | OID_OBSERVE_SUSPENDED
            | OID_OBSERVE_RESUMED
    )
}

/// A response carrying only a sub-opcode and a status byte.
pub(crate) fn build_status_rsp(oid: u8, suboid: u8, status: u8) -> BytesMut {
    let mut b = FrameBuilder::control(MT_RSP, GID_PROP, oid);
    b.u8(suboid);
    b.u8(status);
    b.finish()
}

pub(crate) fn process(
    ctx: &mut Ctx,
    inform_only: bool,
    from: Endpoint,
    frame: &[u8],
    hdr: &Header,
) -> bool {
    if inform_only {
        return false;
    }
    match hdr.mt {
        MT_CMD => {
            if from != Endpoint::Stack {
                error!("unexpected CMD coming from the NFCC");
                return false;
            }
            process_cmd(ctx, frame, hdr)
        }
        MT_NTF => {
            if from != Endpoint::Nfcc {
                error!("unexpected NTF coming from the stack, let it go");
                return false;
            }
            process_ntf(ctx, frame, hdr)
        }
        MT_RSP => {
            error!("unexpected RSP to process, responses are matched by the pump");
            false
        }
        _ => false,
    }
}

fn process_cmd(ctx: &mut Ctx, frame: &[u8], hdr: &Header) -> bool {
    match hdr.oid {
        OID_LIB => process_lib_cmd(ctx, frame),
        OID_FW_PROP => match frame.get(3) {
            Some(&SUB_FW_GET_CONFIG) => {
                if frame.get(4) == Some(&GET_CONFIG_ESE_ATTR) {
                    // Harvest the pipe table on the way back.
                    ctx.pump.post(Endpoint::Nfcc, frame, Some(RspHook::ApduInfo))
                } else {
                    // Pipe lists for other elements, or configs we do not
                    // use: forward, and forward the answer too.
                    ctx.pump.post(Endpoint::Nfcc, frame, Some(RspHook::Passthrough))
                }
            }
            _ => {
                info!("firmware command from the stack, unexpected but let it passthrough");
                ctx.pump.post(Endpoint::Nfcc, frame, Some(RspHook::Passthrough))
            }
        },
        _ => {
            info!("vendor command from the stack, unexpected but let it passthrough");
            ctx.pump.post(Endpoint::Nfcc, frame, Some(RspHook::Passthrough))
        }
    }
}

fn process_lib_cmd(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let suboid = frame.get(3).copied().unwrap_or(0xFF);
    match suboid {
        SUB_SET_PASSTHROUGH => {
            let enable = frame.get(4) == Some(&0x01);
            info!("set passthrough mode: {enable}");
            ctx.state.passthrough = enable;
            let rsp = build_status_rsp(OID_LIB, SUB_SET_PASSTHROUGH, STATUS_OK);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }

        SUB_GET_LIB_VERSION => {
            let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_LIB);
            b.u8(SUB_GET_LIB_VERSION);
            b.u8(STATUS_OK);
            b.u8((LIB_VERSION >> 8) as u8);
            b.u8((LIB_VERSION & 0xFF) as u8);
            ctx.pump.post(Endpoint::Stack, &b.finish(), None)
        }

        SUB_GET_MANUF_DATA => {
            let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_LIB);
            b.u8(SUB_GET_MANUF_DATA);
            if ctx.state.manu_info.is_empty() {
                b.u8(STATUS_NOT_INITIALIZED);
            } else {
                b.u8(STATUS_OK);
                b.bytes(&ctx.state.manu_info);
            }
            ctx.pump.post(Endpoint::Stack, &b.finish(), None)
        }

        SUB_GET_NFCEE_ID_LIST => {
            let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_LIB);
            b.u8(SUB_GET_NFCEE_ID_LIST);
            if ctx.state.active_nfcees.is_empty() {
                b.u8(STATUS_FAILED);
            } else {
                b.u8(STATUS_OK);
                b.u8(ctx.state.active_nfcees.len() as u8);
                b.bytes(&ctx.state.active_nfcees);
            }
            ctx.pump.post(Endpoint::Stack, &b.finish(), None)
        }

        SUB_SETUP_APDU_GATE => {
            if !ctx.state.apdu_gate_ready {
                error!("APDU gate not functional");
                let rsp = build_status_rsp(OID_LIB, suboid, STATUS_FAILED);
                return ctx.pump.post(Endpoint::Stack, &rsp, None);
            }
            let pipe = ctx.state.apdu_pipe_id & 0x7F;
            if !send_hci(ctx, pipe, HCP_TYPE_EVENT, EVT_SE_SOFT_RESET, &[], None) {
                error!("send HCI message failed");
                let rsp = build_status_rsp(OID_LIB, suboid, STATUS_FAILED);
                return ctx.pump.post(Endpoint::Stack, &rsp, None);
            }
            if !send_hci(
                ctx,
                pipe,
                HCP_TYPE_COMMAND,
                ANY_GET_PARAMETER,
                &[ATR_REG_INDEX],
                Some(HciHook::ApduGateAtr),
            ) {
                error!("send HCI message failed");
                let rsp = build_status_rsp(OID_LIB, suboid, STATUS_FAILED);
                return ctx.pump.post(Endpoint::Stack, &rsp, None);
            }
            true
        }

        SUB_TRANSCEIVE_APDU_GATE => {
            if !ctx.state.apdu_gate_ready {
                error!("APDU gate not functional");
                let rsp = build_status_rsp(OID_LIB, suboid, STATUS_FAILED);
                return ctx.pump.post(Endpoint::Stack, &rsp, None);
            }
            let pipe = ctx.state.apdu_pipe_id & 0x7F;
            let apdu = frame.get(4..).unwrap_or(&[]);
            let status = if send_hci(
                ctx,
                pipe,
                HCP_TYPE_EVENT,
                EVT_TRANSMIT_DATA,
                apdu,
                Some(HciHook::ApduGateTransceive),
            ) {
                STATUS_OK
            } else {
                error!("send HCI message failed");
                STATUS_FAILED
            };
            let rsp = build_status_rsp(OID_LIB, suboid, status);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }

        SUB_EMULATE_NFC_A => {
            ctx.state.is_card_a_on = frame.get(4) == Some(&0x01);
            let rsp = build_status_rsp(OID_LIB, SUB_EMULATE_NFC_A, STATUS_OK);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }

        SUB_SET_FELICA_ENABLED => {
            ctx.state.ese_felica_enabled = frame.get(4) == Some(&0x01);
            let rsp = build_status_rsp(OID_LIB, SUB_SET_FELICA_ENABLED, STATUS_OK);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }

        SUB_SET_CUSTOM_POLL_FRAME => {
            ctx.state.cust_poll_frame_set = frame.get(4).is_some_and(|&v| v >= 0x01);
            ctx.state.rf_intf_cust_tx = false;
            match build_custom_poll_cmd(frame) {
                Some(cmd) => {
                    ctx.pump.post(Endpoint::Nfcc, &cmd, Some(RspHook::CustomPollFrame))
                }
                None => {
                    let rsp = build_status_rsp(
                        OID_LIB,
                        SUB_SET_CUSTOM_POLL_FRAME,
                        STATUS_MESSAGE_CORRUPTED,
                    );
                    ctx.pump.post(Endpoint::Stack, &rsp, None)
                }
            }
        }

        other => {
            info!("extension sub-opcode {other:#04x} not supported");
            let rsp = build_status_rsp(OID_LIB, other, STATUS_NOT_SUPPORTED);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }
    }
}

fn process_ntf(ctx: &mut Ctx, frame: &[u8], hdr: &Header) -> bool {
    match hdr.oid {
        OID_PWR_MON_ON => {
            ctx.state.pwr_mon_active_rw = true;
            ctx.state.pwr_mon_errors = 0;
            true
        }

        OID_PWR_MON_OFF => {
            ctx.pump.watchdog_remove(WatchdogKind::ActiveRwTooLong);
            if ctx.state.pwr_mon_active_rw {
                ctx.state.pwr_mon_active_rw = false;
            } else {
                ctx.state.pwr_mon_errors += 1;
                if ctx.state.pwr_mon_errors > 20 {
                    error!("too many power-monitor OFF without ON, recovery");
                    if !send_recovery(ctx.pump, 0) {
                        error!("failed to send CORE_RESET_NTF, critical failure");
                    }
                }
            }
            true
        }

        OID_OBSERVE_SUSPENDED => {
            ctx.state.observe_suspended = true;
            // Replay on the android opcode, dropping the two CRC bytes the
            // firmware appends to the matched motif.
            let (Some(&kind), Some(&raw_len)) = (frame.get(3), frame.get(4)) else {
                error!("observe-suspended notification too short: {}", frame.len());
                return false;
            };
            let motif_len = (raw_len as usize).saturating_sub(2);
            let Some(motif) = frame.get(5..5 + motif_len) else {
                error!("observe-suspended notification too short: {}", frame.len());
                return false;
            };
            let mut b = FrameBuilder::control(MT_NTF, GID_PROP, OID_ANDROID);
            b.u8(crate::android::SUB_OBSERVER_SUSPENDED_NTF);
            b.u8(kind);
            b.u8(motif_len as u8);
            b.bytes(motif);
            ctx.pump.post(Endpoint::Stack, &b.finish(), None)
        }

        OID_OBSERVE_RESUMED => {
            ctx.state.observe_suspended = false;
            let mut b = FrameBuilder::control(MT_NTF, GID_PROP, OID_ANDROID);
            b.u8(crate::android::SUB_OBSERVER_RESUMED_NTF);
            ctx.pump.post(Endpoint::Stack, &b.finish(), None)
        }

        OID_FW_PROP => {
            match frame.get(4) {
                Some(&SUB_FW_LOG) => parse_fw_log(ctx, frame),
                _ => info!("vendor NTF not processed, but blocked"),
            }
            true
        }

        _ => {
            info!("vendor NTF not processed, but blocked");
            true
        }
    }
}

/// Fragment an HCP message onto the HCI connection. When a response hook is
/// given, the reassembly interceptor is armed before the first fragment goes
/// out. Each fragment lends the firmware one flow-control credit.
pub(crate) fn send_hci(
    ctx: &mut Ctx,
    pipe: u8,
    hcp_type: u8,
    instruction: u8,
    msg: &[u8],
    hook: Option<HciHook>,
) -> bool {
    const MAX_SEG: usize = 255;

    if let Some(hook) = hook {
        if ctx.state.hci_rsp.is_some() {
            error!("HCI response handler already armed");
            return false;
        }
        if !ctx.registry.register(Matcher {
            hook: Hook::HciReassembly,
            mt: Some(MT_DATA),
            gid: Some(HCI_CONN_ID),
            oid: None,
            suboid: None,
        }) {
            error!("error registering the HCI reassembly interceptor");
            return false;
        }
        ctx.state.hci_buf.clear();
        ctx.state.hci_rsp = Some(hook);
    }

    let mut first = true;
    let mut rest = msg;
    while first || !rest.is_empty() {
        // The HCP header is two bytes on the first fragment, one after.
        let room = if first { MAX_SEG - 2 } else { MAX_SEG - 1 };
        let take = rest.len().min(room);
        let last = rest.len() <= room;

        let mut b = FrameBuilder::data(HCI_CONN_ID);
        b.u8(((last as u8) << 7) | (pipe & 0x7F));
        if first {
            b.u8((hcp_type << 6) | instruction);
        }
        b.bytes(&rest[..take]);
        rest = &rest[take..];
        first = false;

        ctx.state.hci_lent_credits = ctx.state.hci_lent_credits.saturating_add(1);
        if !ctx.pump.post(Endpoint::Nfcc, &b.finish(), None) {
            error!("failed to send an HCI fragment");
            return false;
        }
    }
    true
}

/// Registry hook: collect HCI fragments, hand the completed frame to the
/// armed continuation, and disarm unless the element asked for more time.
pub(crate) fn hci_reassembly(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let Ok(hdr) = parse_header(frame) else { return false };
    if hdr.gid != HCI_CONN_ID {
        debug!("not HCI data, ignoring");
        return false;
    }
    let Some(&frag_hdr) = frame.get(3) else { return false };

    let first = ctx.state.hci_buf.is_empty();
    let mut complete = frag_hdr & 0x80 != 0;
    let body = if first { &frame[3..] } else { &frame[4..] };
    if ctx.state.hci_buf.len() + body.len() > MAX_HCI_RECEIVE {
        error!("too much HCI data, truncating");
        complete = true;
    } else {
        ctx.state.hci_buf.extend_from_slice(body);
    }

    let mut handled = true;
    if complete {
        let buf = std::mem::take(&mut ctx.state.hci_buf);
        if let Some(hook) = ctx.state.hci_rsp {
            handled = run_hci_hook(ctx, hook, &buf);
        }
        let instruction = buf.get(1).copied().unwrap_or(0) & 0x3F;
        if instruction != EVT_WTX_REQUEST {
            ctx.state.hci_rsp = None;
            ctx.registry.unregister(Hook::HciReassembly);
        }
        ctx.state.hci_buf = buf;
        ctx.state.hci_buf.clear();
    }
    handled
}

fn run_hci_hook(ctx: &mut Ctx, hook: HciHook, payload: &[u8]) -> bool {
    match hook {
        HciHook::ApduGateAtr => apdu_gate_atr(ctx, payload),
        HciHook::ApduGateTransceive => apdu_gate_transceive(ctx, payload),
    }
}

/// Parse the ATR answer for the BWI field (TB3, interface level 3) and turn
/// it into the transmit waiting time the extension service should honor.
fn apdu_gate_atr(ctx: &mut Ctx, payload: &[u8]) -> bool {
    ctx.state.tx_waiting_time = 0xFF;
    let mut status = STATUS_OK;

    if payload.get(1) == Some(&0x80) {
        let mut idx = 3usize;
        let mut level = 1;
        while level != 3 {
            let Some(&td) = payload.get(idx) else { break };
            let mut present = 0usize;
            for i in 0..4 {
                if td & (0x10 << i) != 0 {
                    present += 1;
                }
            }
            // A next level exists only while TDi is advertised.
            if td & 0x80 != 0 {
                level += 1;
            } else {
                break;
            }
            idx += present;
        }
        if level == 3 {
            if let Some(&t3) = payload.get(idx) {
                let mut skip = 0usize;
                if t3 & 0x10 != 0 {
                    skip += 1; // TA3 sits before TB3
                }
                if t3 & 0x20 != 0 {
                    skip += 1;
                    if let Some(&tb3) = payload.get(idx + skip) {
                        let bwi = (tb3 & 0xF0) >> 4;
                        let mut wt = (1u32 << bwi) * 100; // ms
                        wt = wt * 10 / 3; // the element clock may run 30% slow
                        ctx.state.tx_waiting_time = wt;
                        info!("APDU gate waiting time={wt}");
                    }
                }
            }
        }
    } else {
        status = STATUS_FAILED;
    }

    let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_LIB);
    b.u8(SUB_SETUP_APDU_GATE);
    b.u8(status);
    b.u8((ctx.state.tx_waiting_time >> 8) as u8);
    b.u8((ctx.state.tx_waiting_time & 0xFF) as u8);
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

fn apdu_gate_transceive(ctx: &mut Ctx, payload: &[u8]) -> bool {
    let (Some(&pipe_byte), Some(&hcp)) = (payload.first(), payload.get(1)) else {
        return false;
    };
    if pipe_byte & 0x7F != ctx.state.apdu_pipe_id {
        error!("HCI data not from the APDU pipe");
        return false;
    }
    if hcp >> 6 != HCP_TYPE_EVENT {
        error!("not an HCP event");
        return false;
    }
    let instruction = hcp & 0x3F;

    let mut b = FrameBuilder::control(MT_NTF, GID_PROP, OID_LIB);
    b.u8(SUB_TRANSCEIVE_APDU_GATE);
    b.u8(STATUS_OK);
    if instruction == EVT_TRANSMIT_DATA {
        b.bytes(&payload[2..]);
    }
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

/// Pump continuation for the vendor get-config harvesting the pipe table:
/// remember whether a usable APDU gate exists, then pass the answer along.
pub(crate) fn apdu_info_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    if frame.get(3) != Some(&STATUS_OK) {
        error!("pipe list status NOK");
    } else {
        ctx.state.apdu_gate_ready = false;
        let entries = frame.get(6).copied().unwrap_or(0) as usize / 12;
        for i in 0..entries {
            let base = 12 * i;
            let (Some(&gate), Some(&pipe), Some(&pipe_state)) =
                (frame.get(base + 8), frame.get(base + 11), frame.get(base + 12))
            else {
                break;
            };
            if gate == 0xF0 && pipe_state == 0x06 {
                ctx.state.apdu_gate_ready = true;
                ctx.state.apdu_pipe_id = pipe;
                info!("found functional APDU gate, pipe={pipe:#04x}");
                break;
            }
        }
    }
    ctx.pump.post(Endpoint::Stack, frame, None)
}

/// Translate the extension custom-poll command (up to 4 frames) into the
/// firmware encoding, injecting type A/B CRCs where the frame asks for them.
fn build_custom_poll_cmd(frame: &[u8]) -> Option<BytesMut> {
    let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_SET_CUST_POLL_FRAME);
    if frame.len() < 5 {
        error!("custom poll frame command too short");
        return None;
    }
    let mut input = &frame[4..];
    let frames = input[0];
    if frames > 4 {
        error!("custom poll frame command has too many frames");
        return None;
    }
    b.u8(frames);
    input = &input[1..];

    for _ in 0..frames {
        if input.len() < 3 {
            error!("custom poll frame command too short");
            return None;
        }
        let qual = input[0];
        let frame_type = qual & 0x07;
        let len_byte = input[1];
        let motif_len = (len_byte as usize).saturating_sub(1);
        let wait_byte = input[2];
        let inject_crc = wait_byte & 0x80 != 0 && frame_type <= 0x01;
        if input.len() < 3 + motif_len {
            error!("custom poll frame command too short");
            return None;
        }
        let motif = &input[3..3 + motif_len];
        b.u8(qual);
        b.u8(len_byte.wrapping_add(if inject_crc { 2 } else { 0 }));
        b.u8(wait_byte);
        b.bytes(motif);
        if inject_crc {
            let crc = if frame_type == 0x00 { crc_a(motif) } else { crc_b(motif) };
            b.u8((crc & 0xFF) as u8);
            b.u8((crc >> 8) as u8);
        }
        input = &input[3 + motif_len..];
    }
    Some(b.finish())
}

/// Pump continuation for the translated custom-poll command.
pub(crate) fn custom_poll_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_LIB);
    b.u8(SUB_SET_CUSTOM_POLL_FRAME);
    b.u8(frame.get(3).copied().unwrap_or(STATUS_FAILED));
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

/// Walk the TLVs of a firmware log notification and feed the secure-element
/// monitor with each record.
pub(crate) fn parse_fw_log(ctx: &mut Ctx, frame: &[u8]) {
    let format = frame.get(3).copied().unwrap_or(0);
    let mut pos = 6usize;
    while pos + 2 <= frame.len() {
        let tlv_len = frame[pos + 1] as usize + 2;
        if pos + tlv_len > frame.len() {
            break;
        }
        ese_monitor(ctx, format, &frame[pos..pos + tlv_len]);
        pos += tlv_len;
    }
}

/// Detect a secure element endlessly retransmitting the same SWP frame. The
/// controller resends a frame the element did not acknowledge; thirty
/// identical transmissions with no reception in between means the element is
/// stuck and needs a disable/reset cycle.
fn ese_monitor(ctx: &mut Ctx, format: u8, tlv: &[u8]) {
    let ese = &mut ctx.state.ese;
    let mut data_len = tlv.len();
    if format & 0x01 != 0 {
        // Ignore the trailing timestamp.
        data_len = data_len.saturating_sub(4);
    }
    let Some(&kind) = tlv.first() else { return };

    if kind == FWLOG_SWP_DEACTIVATED {
        ese.clear();
        return;
    }
    if data_len <= 2 {
        return;
    }
    if tlv.get(2) != Some(&0x01) {
        // SWP traffic for something else than the secure element.
        return;
    }

    if (FWLOG_RX_ACT..=FWLOG_RX_ERR).contains(&kind) {
        // The element answered; the retransmission counter starts over.
        ese.last_tx_count = 0;
        ese.last_tx_len = 0;

        // Duplicate ANY_SET_PARAMETER detector, e.g. TT LL SS RL 86 A3 01 07.
        if data_len >= 8 && tlv[4] & 0xC0 == 0x80 {
            let has_cb = tlv[5] & 0x80 != 0;
            let pid = tlv[5] & 0x7F;
            let mut first_fragment = true;
            if (0x21..=0x24).contains(&pid) {
                let slot = (pid - 0x21) as usize;
                if ese.last_rx_is_frag[slot] {
                    first_fragment = false;
                }
                ese.last_rx_is_frag[slot] = !has_cb;
            }

            if first_fragment && (0x21..=0x24).contains(&pid) && tlv[6] == 0x01 {
                let new_len = data_len - 4;
                let cmp = new_len.min(ese.last_rx_param.len()) - 1;
                if ese.last_rx_param_len == new_len
                    // N(S) advanced, so this is not the same I-frame resent.
                    && (tlv[4] & 0x38) != (ese.last_rx_param[0] & 0x38)
                    && tlv[5..5 + cmp] == ese.last_rx_param[1..1 + cmp]
                {
                    error!("same ANY_SET_PARAMETER received from the secure element twice, maybe stuck");
                } else {
                    ese.last_rx_param_len = new_len;
                    let take = new_len.min(ese.last_rx_param.len());
                    ese.last_rx_param[..take].copy_from_slice(&tlv[4..4 + take]);
                    debug!("saved param: {:#04x}", tlv.get(7).copied().unwrap_or(0));
                }
            } else if first_fragment && ese.last_rx_param_len != 0 {
                debug!("clear saved param");
                ese.last_rx_param_len = 0;
            }
        }
    }

    if (FWLOG_TX_CTRL..=FWLOG_TX_IR).contains(&kind) {
        let cmp = if data_len < 7 { data_len - 2 } else { 5 };
        if data_len == ese.last_tx_len && tlv[2..2 + cmp] == ese.last_tx[..cmp] {
            ese.last_tx_count += 1;
            if ese.last_tx_count >= 30 {
                error!("same frame repeated on SWP, disabling and resetting the secure element");
                ese.stuck = true;
                ese.last_tx_count = 0;
                let mut b = FrameBuilder::control(MT_CMD, GID_NFCEE, NFCEE_MODE_SET);
                b.u8(ESE_NFCEE_ID);
                b.u8(0x00); // disable
                ctx.pump.post(Endpoint::Nfcc, &b.finish(), Some(RspHook::EseDisable));
            }
        } else {
            ese.last_tx_count = 0;
            ese.last_tx[..cmp].copy_from_slice(&tlv[2..2 + cmp]);
            ese.last_tx_len = data_len;
        }
    }
}

/// The SWP link is down; now reset the element itself.
pub(crate) fn ese_disable_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    if frame.get(3) != Some(&STATUS_OK) {
        error!("secure element disable status NOK");
        return true;
    }
    let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_FW_TEST);
    b.u8(SUB_TEST_RESET_SE);
    b.u8(ESE_NFCEE_ID);
    ctx.pump.post(Endpoint::Nfcc, &b.finish(), Some(RspHook::EseReset))
}

/// The element is back; restart the whole stack on top of it.
pub(crate) fn ese_reset_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    if frame.get(3) != Some(&STATUS_OK) {
        error!("secure element reset status NOK");
        return true;
    }
    ctx.state.ese.stuck = false;
    debug!("send CORE_RESET_NTF after secure element recovery");
    send_recovery(ctx.pump, 0x00)
}
