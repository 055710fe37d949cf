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

//! Translator for the Android NCI command family. Commands arrive on the
//! proprietary android opcode and are rewritten into the vendor commands the
//! firmware actually understands; the vendor answers are rewritten back.

use bytes::BytesMut;
use log::{debug, error};

use crate::crc::{crc_a, crc_b};
use crate::packets::*;
use crate::registry::{Hook, Matcher, RspHook};
use crate::vendor::{
    build_status_rsp, FWLOG_ACTIVE_A, FWLOG_CE_RX, FWLOG_CE_RX_ERROR, FWLOG_CE_TX,
    FWLOG_FIELD_LEVEL, FWLOG_FIELD_OFF, FWLOG_FIELD_ON, FWLOG_IDLE, FWLOG_SLEEP_A, OID_ANDROID,
    OID_FW_PROP, OID_OBSERVE_RESUMED, OID_OBSERVE_SUSPENDED, OID_SET_CUST_POLL_FRAME,
    OID_SET_EXIT_FRAME, SUB_FW_LOG,
};
use crate::{Ctx, Endpoint};

#[cfg(feature = "uid-sak")]
use crate::state::UidSakStep;
#[cfg(feature = "uid-sak")]
use crate::vendor::{SUB_FW_GET_CONFIG, SUB_FW_SET_CONFIG};

pub(crate) const SUB_GET_CAPS: u8 = 0x00;
pub(crate) const SUB_PASSIVE_OBSERVE: u8 = 0x02;
pub(crate) const SUB_POLLING_FRAME_NTF: u8 = 0x03;
pub(crate) const SUB_QUERY_PASSIVE_OBSERVE: u8 = 0x04;
pub(crate) const SUB_SET_OBSERVER_TECH: u8 = 0x05;
pub(crate) const SUB_SET_EXIT_FRAME: u8 = 0x11;
pub(crate) const SUB_OBSERVER_SUSPENDED_NTF: u8 = 0x13;
pub(crate) const SUB_OBSERVER_RESUMED_NTF: u8 = 0x14;
pub(crate) const SUB_SET_TECH_A_ANNOTATION: u8 = 0x15;
#[cfg(feature = "uid-sak")]
pub(crate) const SUB_SET_UID_AND_SAK: u8 = 0x16;

const OBSERVE_DISABLE: u8 = 0x00;
const OBSERVE_ENABLE: u8 = 0x01;
const OBSERVE_TECH_A: u8 = 0x01;
const OBSERVE_TECH_B: u8 = 0x02;
const OBSERVE_ALL: u8 = 0x07;
const OBSERVE_NONE: u8 = 0x00;

/// Proprietary configuration parameter: do not answer on passive listen.
const PARAM_DONT_ANSWER_PASSIVE_LISTEN: u8 = 0xA3;

// Capability TLV ids and values.
const CAP_PASSIVE_OBSERVE: u8 = 0x00;
const CAP_POLLING_FRAME: u8 = 0x01;
const CAP_POWER_SAVING: u8 = 0x02;
const CAP_AUTOTRANSACT_FILTER: u8 = 0x03;
const CAP_EXIT_FRAME_COUNT: u8 = 0x04;
const CAP_READER_ANNOTATION: u8 = 0x05;

const OBSERVE_UNSUPPORTED: u8 = 0x00;
const OBSERVE_WITH_DEACTIVATION: u8 = 0x01;
const OBSERVE_WITHOUT_DEACTIVATION: u8 = 0x02;

const EXIT_FRAME_TABLE_SIZE: u8 = 10;

// Polling frame notification tags.
const TAG_FIELD_CHANGE: u8 = 0;
const TAG_NFC_A: u8 = 1;
const TAG_NFC_B: u8 = 2;
const TAG_NFC_F: u8 = 3;
const TAG_NFC_V: u8 = 4;
const TAG_UNKNOWN: u8 = 7;

fn format_oldest(format: u8) -> bool {
    format & 0xF0 == 0x10
}
fn format_middle(format: u8) -> bool {
    format & 0xF0 == 0x20
}
fn format_newest(format: u8) -> bool {
    format & 0xF0 == 0x30
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
        MT_CMD => process_cmd(ctx, frame),
        MT_RSP | MT_NTF => {
            if from == Endpoint::Nfcc {
                // A lower layer that translated some android commands itself;
                // we synthesize our own answers, so drop these.
                debug!("discard android opcode traffic received from below");
                true
            } else {
                error!("unexpected RSP or NTF on the android opcode");
                false
            }
        }
        _ => false,
    }
}

fn process_cmd(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let suboid = frame.get(3).copied().unwrap_or(0xFF);
    match suboid {
        SUB_GET_CAPS => {
            let rsp = build_get_caps_rsp(ctx);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }

        SUB_QUERY_PASSIVE_OBSERVE => {
            let cmd = if ctx.state.observe_per_tech {
                FrameBuilder::control(MT_CMD, GID_RF, RF_GET_LISTEN_OBSERVE_MODE_STATE).finish()
            } else {
                let mut b = FrameBuilder::control(MT_CMD, GID_CORE, CORE_GET_CONFIG);
                b.u8(1); // one parameter
                b.u8(PARAM_DONT_ANSWER_PASSIVE_LISTEN);
                b.finish()
            };
            ctx.pump.post(Endpoint::Nfcc, &cmd, Some(RspHook::ObserveGet))
        }

        SUB_PASSIVE_OBSERVE => {
            let enable = frame.get(4).copied().unwrap_or(OBSERVE_DISABLE);
            let cmd = if ctx.state.observe_per_tech {
                // The stack may still use the legacy command while the
                // per-tech encoding is active; the firmware rejects the
                // config write then, so map it onto A and B which covers the
                // real use cases.
                build_set_listen_observe(if enable == OBSERVE_ENABLE {
                    OBSERVE_TECH_A | OBSERVE_TECH_B
                } else {
                    OBSERVE_DISABLE
                })
            } else {
                let mut b = FrameBuilder::control(MT_CMD, GID_CORE, CORE_SET_CONFIG);
                b.u8(1); // one parameter
                b.u8(PARAM_DONT_ANSWER_PASSIVE_LISTEN);
                b.u8(1); // one byte
                b.u8(enable);
                b.finish()
            };
            ctx.pump.post(Endpoint::Nfcc, &cmd, Some(RspHook::ObserveSetConfig))
        }

        SUB_SET_OBSERVER_TECH => {
            let mode = frame.get(4).copied().unwrap_or(OBSERVE_DISABLE);
            let cmd = build_set_listen_observe(mode);
            ctx.pump.post(Endpoint::Nfcc, &cmd, Some(RspHook::ObserveSetTech))
        }

        SUB_SET_EXIT_FRAME => match build_exit_frame_cmd(frame) {
            Some(cmd) => ctx.pump.post(Endpoint::Nfcc, &cmd, Some(RspHook::ExitFrame)),
            None => {
                let rsp = build_status_rsp(
                    OID_ANDROID,
                    SUB_SET_EXIT_FRAME,
                    STATUS_MESSAGE_CORRUPTED,
                );
                ctx.pump.post(Endpoint::Stack, &rsp, None)
            }
        },

        SUB_SET_TECH_A_ANNOTATION => {
            if ctx.state.cust_poll_frame_set {
                // A custom poll frame already owns the slot; agree politely.
                let rsp = build_status_rsp(OID_ANDROID, SUB_SET_TECH_A_ANNOTATION, STATUS_OK);
                return ctx.pump.post(Endpoint::Stack, &rsp, None);
            }
            match build_annotation_cmd(frame) {
                Some(cmd) => ctx.pump.post(Endpoint::Nfcc, &cmd, Some(RspHook::AnnotationPoll)),
                None => {
                    let rsp = build_status_rsp(
                        OID_ANDROID,
                        SUB_SET_TECH_A_ANNOTATION,
                        STATUS_MESSAGE_CORRUPTED,
                    );
                    ctx.pump.post(Endpoint::Stack, &rsp, None)
                }
            }
        }

        #[cfg(feature = "uid-sak")]
        SUB_SET_UID_AND_SAK => start_uid_and_sak(ctx, frame),

        other => {
            error!("unsupported android sub-opcode {other:#04x}");
            let rsp = build_status_rsp(OID_ANDROID, other, STATUS_NOT_SUPPORTED);
            ctx.pump.post(Endpoint::Stack, &rsp, None)
        }
    }
}

/// Capability reply derived from the captured firmware identity. Hardware
/// without the newer observe features reports the conservative set.
fn build_get_caps_rsp(ctx: &mut Ctx) -> BytesMut {
    if ctx.state.manu_info.is_empty() {
        error!("android GET_CAPS received but no firmware information available yet");
        return build_status_rsp(OID_ANDROID, SUB_GET_CAPS, STATUS_NOT_INITIALIZED);
    }
    let fw_gen = ctx.state.fw_generation();
    if fw_gen < 2 {
        debug!("no android command support in this firmware (gen {fw_gen})");
        return build_status_rsp(OID_ANDROID, SUB_GET_CAPS, STATUS_NOT_SUPPORTED);
    }

    let newest_major2 = ctx.state.is_newest_family() && ctx.state.fw_major() == 0x02;
    let minor = ctx.state.fw_minor();

    let mut observe = if fw_gen == 2 {
        OBSERVE_WITH_DEACTIVATION
    } else if fw_gen > 3 {
        OBSERVE_WITHOUT_DEACTIVATION
    } else if newest_major2 {
        if minor == 0x01 {
            // That firmware had a defect in the observe path.
            OBSERVE_UNSUPPORTED
        } else if minor <= 0x04 {
            OBSERVE_WITH_DEACTIVATION
        } else {
            // Per-technology observe without deactivation since minor 5.
            OBSERVE_WITHOUT_DEACTIVATION
        }
    } else {
        OBSERVE_WITHOUT_DEACTIVATION
    };

    let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_ANDROID);
    b.u8(SUB_GET_CAPS);
    b.u8(STATUS_OK);
    b.u16_le(0x0000); // version word
    let count_at = b.mark();
    let mut count = 0u8;

    b.u8(CAP_PASSIVE_OBSERVE);
    b.u8(1);
    b.u8(observe);
    count += 1;

    if observe == OBSERVE_WITHOUT_DEACTIVATION {
        // Use the per-technology command from now on, unless the stack
        // falls back to the legacy one.
        ctx.state.observe_per_tech = true;
    }

    // Polling frame notifications ride on the firmware log interceptor.
    if observe != OBSERVE_UNSUPPORTED
        && !ctx.registry.register(Matcher {
            hook: Hook::PollingFrame,
            mt: Some(MT_NTF),
            gid: Some(GID_PROP),
            oid: Some(OID_FW_PROP),
            suboid: Some(SUB_FW_LOG),
        })
    {
        observe = OBSERVE_UNSUPPORTED;
    }
    b.u8(CAP_POLLING_FRAME);
    b.u8(1);
    b.u8(if observe == OBSERVE_UNSUPPORTED { 0x00 } else { 0x01 });
    count += 1;

    b.u8(CAP_POWER_SAVING);
    b.u8(1);
    b.u8(0x00); // not offered on this hardware
    count += 1;

    let mut exit_frames = if fw_gen == 2 {
        false
    } else if fw_gen > 3 {
        true
    } else if newest_major2 {
        minor > 0x05
    } else {
        true
    };
    if exit_frames {
        // Exit frames suspend observe mode; swallow the firmware's own
        // suspend/resume notifications while the feature is in use.
        let gate = |oid| Matcher {
            hook: Hook::ObserveSuspendGate,
            mt: Some(MT_NTF),
            gid: Some(GID_PROP),
            oid: Some(oid),
            suboid: None,
        };
        if !ctx.registry.register(gate(OID_OBSERVE_SUSPENDED)) {
            error!("failed to register the suspend interceptor, reporting exit frames unsupported");
            exit_frames = false;
        } else if !ctx.registry.register(gate(OID_OBSERVE_RESUMED)) {
            error!("failed to register the resume interceptor, reporting exit frames unsupported");
            ctx.registry.unregister(Hook::ObserveSuspendGate);
            exit_frames = false;
        }
    }
    b.u8(CAP_AUTOTRANSACT_FILTER);
    b.u8(1);
    b.u8(exit_frames as u8);
    count += 1;

    b.u8(CAP_EXIT_FRAME_COUNT);
    b.u8(1);
    b.u8(if exit_frames { EXIT_FRAME_TABLE_SIZE } else { 0 });
    count += 1;

    let annotations = if fw_gen == 2 {
        false
    } else if fw_gen > 3 {
        true
    } else if newest_major2 {
        minor > 0x05
    } else {
        false
    };
    b.u8(CAP_READER_ANNOTATION);
    b.u8(1);
    b.u8(annotations as u8);
    count += 1;

    b.patch(count_at, count);
    b.finish()
}

fn build_set_listen_observe(mode: u8) -> BytesMut {
    let mut b = FrameBuilder::control(MT_CMD, GID_RF, RF_SET_LISTEN_OBSERVE_MODE);
    // Mask with the technologies this firmware can observe.
    b.u8(mode & OBSERVE_ALL);
    b.finish()
}

/// Pump continuation for the observe-mode query.
pub(crate) fn observe_get_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let status = frame.get(3).copied().unwrap_or(STATUS_FAILED);
    let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_ANDROID);
    b.u8(SUB_QUERY_PASSIVE_OBSERVE);
    b.u8(status);
    if status == STATUS_OK {
        let mode = if ctx.state.observe_per_tech {
            let current = frame.get(4).copied().unwrap_or(OBSERVE_NONE);
            if current == OBSERVE_NONE || ctx.state.observe_suspended {
                OBSERVE_DISABLE
            } else {
                current
            }
        } else {
            // CORE_GET_CONFIG_RSP: status, count, id, length, value.
            frame.get(7).copied().unwrap_or(OBSERVE_DISABLE)
        };
        b.u8(mode);
    }
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

/// Pump continuation for both observe-mode set encodings.
pub(crate) fn observe_set_rsp(ctx: &mut Ctx, frame: &[u8], suboid: u8) -> bool {
    let mut b = FrameBuilder::control(MT_RSP, GID_PROP, OID_ANDROID);
    b.u8(suboid);
    b.u8(frame.get(3).copied().unwrap_or(STATUS_FAILED));
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

/// Pump continuation for the translated exit-frame table.
pub(crate) fn exit_frame_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    observe_set_rsp(ctx, frame, SUB_SET_EXIT_FRAME)
}

/// Pump continuation for the translated annotation frame.
pub(crate) fn annotation_rsp(ctx: &mut Ctx, frame: &[u8]) -> bool {
    observe_set_rsp(ctx, frame, SUB_SET_TECH_A_ANNOTATION)
}

/// Registry hook consuming the firmware suspend/resume notifications while
/// exit frames are negotiated.
pub(crate) fn observe_gate(hdr: &Header) -> bool {
    debug!(
        "exit frame: observe mode is {}",
        if hdr.oid == OID_OBSERVE_SUSPENDED { "suspended" } else { "resumed" }
    );
    true
}

/// Translate the android exit-frame table into the vendor command. Type A/B
/// motifs matched in full get the ISO 14443 CRC appended to data and mask;
/// "longer-than" motifs are forwarded untouched (the firmware matches the
/// prefix only; whether it wants a CRC there is still an open question with
/// the firmware interface owners).
fn build_exit_frame_cmd(incoming: &[u8]) -> Option<BytesMut> {
    if incoming.len() < 8 {
        error!("exit frame command too short");
        return None;
    }
    if incoming.len() > MAX_MSG_LEN {
        // Ten entries of up to 35 bytes can exceed one frame; until the
        // firmware accepts a split table, refuse.
        error!("exit frame command too long, not supported yet");
        return None;
    }

    let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_SET_EXIT_FRAME);
    let mut input = &incoming[4..];
    b.u8(input[0]); // "more" marker
    if input[1] < 0x64 && input[2] == 0x00 {
        // The firmware minimum timeout is 100 ms.
        b.u8(0x64);
        b.u8(0x00);
    } else {
        b.u8(input[1]);
        b.u8(input[2]);
    }
    let mut frames = input[3];
    b.u8(frames);
    input = &input[4..];

    while frames > 0 {
        if input.len() < 2 {
            error!("exit frame command too short");
            return None;
        }
        let mut qual = input[0];
        let value_len = input[1] as usize;
        let motif_len = value_len.saturating_sub(1) / 2;
        input = &input[2..];
        if input.len() < value_len {
            error!("exit frame command too short");
            return None;
        }

        if motif_len > 15 {
            // No room left for the CRC bytes; match on the prefix instead.
            qual |= 0x10;
        }
        let crc = if qual & 0x10 == 0 {
            match qual & 0x07 {
                0x00 => Some(crc_a(&input[1..1 + motif_len])),
                0x01 => Some(crc_b(&input[1..1 + motif_len])),
                _ => None,
            }
        } else {
            None
        };

        let needed = 2 + value_len + if crc.is_some() { 4 } else { 0 };
        if MAX_MSG_LEN - b.len() < needed {
            error!("exit frame table leaves no room for the CRC bytes");
            return None;
        }

        b.u8(qual);
        b.u8(value_len as u8);
        match crc {
            None => {
                // Power state, data and mask forwarded as they came.
                b.bytes(&input[..value_len]);
            }
            Some(crc) => {
                b.u8(input[0]); // power state
                b.bytes(&input[1..1 + motif_len]); // data
                b.u8((crc & 0xFF) as u8);
                b.u8((crc >> 8) as u8);
                let mask = &input[1 + motif_len..1 + 2 * motif_len];
                let exact = mask.iter().all(|&m| m == 0xFF);
                b.bytes(mask);
                // The CRC can only be required to match when every motif
                // byte is matched exactly.
                let fill = if exact { 0xFF } else { 0x00 };
                b.u8(fill);
                b.u8(fill);
            }
        }
        input = &input[value_len..];
        frames -= 1;
    }
    Some(b.finish())
}

/// Translate the tech-A polling-loop annotation into the vendor custom-poll
/// command, appending the type A CRC the firmware transmits with the frame.
fn build_annotation_cmd(incoming: &[u8]) -> Option<BytesMut> {
    if incoming.len() < 5 {
        error!("annotation command too short");
        return None;
    }
    let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_SET_CUST_POLL_FRAME);
    let mut input = &incoming[4..];
    let frames = input[0];
    if frames > 1 {
        error!("annotation command has an unsupported number of frames");
        return None;
    }
    b.u8(frames);
    input = &input[1..];

    if frames == 1 {
        if input.len() < 3 {
            error!("annotation command too short");
            return None;
        }
        if input[0] != 0x20 {
            error!("annotation command has an unsupported position/type value");
            return None;
        }
        b.u8(0x20); // position 1, no response expected, type A standard
        let len_byte = input[1];
        let motif_len = (len_byte as usize).saturating_sub(3);
        b.u8(len_byte);
        b.u8(input[2]); // waiting time
        if input.len() < 3 + motif_len {
            error!("annotation command too short");
            return None;
        }
        let motif = &input[3..3 + motif_len];
        let crc = crc_a(motif);
        b.bytes(motif);
        b.u8((crc & 0xFF) as u8);
        b.u8((crc >> 8) as u8);
    }
    Some(b.finish())
}

#[cfg(feature = "uid-sak")]
fn start_uid_and_sak(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let Some(&uid_len) = frame.get(6) else {
        return uid_sak_reply(ctx, STATUS_MESSAGE_CORRUPTED);
    };
    let uid_len = (uid_len as usize).min(10);
    let (Some(uid), Some(&sak)) = (frame.get(7..7 + uid_len), frame.get(9 + uid_len)) else {
        return uid_sak_reply(ctx, STATUS_MESSAGE_CORRUPTED);
    };
    ctx.state.uid_len = uid_len;
    ctx.state.uid[..uid_len].copy_from_slice(uid);
    ctx.state.sak = sak;
    debug!("SAK={:#04x}, UID length={}", sak, uid_len);

    ctx.state.uid_sak_step = UidSakStep::GetConfig;
    let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_FW_PROP);
    b.u8(SUB_FW_GET_CONFIG);
    b.u8(0x00);
    b.u8(0x04); // NDEF NFCEE subset
    b.u8(0x01);
    b.u8(0x00);
    ctx.pump.post(Endpoint::Nfcc, &b.finish(), Some(RspHook::UidSakStep))
}

/// Pump continuation walking the get-config / set-config exchange that
/// patches UID and SAK into the NDEF NFCEE configuration blob.
#[cfg(feature = "uid-sak")]
pub(crate) fn uid_sak_step(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let status = frame.get(3).copied().unwrap_or(STATUS_FAILED);
    if status != STATUS_OK {
        return uid_sak_reply(ctx, status);
    }
    match ctx.state.uid_sak_step {
        UidSakStep::GetConfig => {
            debug!("received the configuration blob");
            let blob_len = frame.get(6).copied().unwrap_or(0) as usize;
            let uid_len = ctx.state.uid_len;
            let Some(blob) = frame.get(7..7 + blob_len) else {
                return uid_sak_reply(ctx, STATUS_MESSAGE_CORRUPTED);
            };
            if blob_len < 72 + uid_len {
                return uid_sak_reply(ctx, STATUS_MESSAGE_CORRUPTED);
            }
            let mut blob = blob.to_vec();
            blob[20] = uid_len as u8;
            blob[26] = ctx.state.sak;
            blob[72..72 + uid_len].copy_from_slice(&ctx.state.uid[..uid_len]);
            ctx.state.uid_sak_step = UidSakStep::SetConfig;

            let mut b = FrameBuilder::control(MT_CMD, GID_PROP, OID_FW_PROP);
            b.u8(SUB_FW_SET_CONFIG);
            b.u8(0x00);
            b.u8(0x04); // NDEF NFCEE subset
            b.u8(0x01);
            b.u8(0x00); // parameter id
            b.u8(blob_len as u8);
            b.bytes(&blob);
            if !ctx.pump.post(Endpoint::Nfcc, &b.finish(), Some(RspHook::UidSakStep)) {
                return uid_sak_reply(ctx, STATUS_FAILED);
            }
            true
        }
        UidSakStep::SetConfig => {
            debug!("configuration blob stored");
            uid_sak_reply(ctx, STATUS_OK)
        }
    }
}

#[cfg(feature = "uid-sak")]
fn uid_sak_reply(ctx: &mut Ctx, status: u8) -> bool {
    ctx.state.uid_sak_step = UidSakStep::GetConfig;
    let rsp = build_status_rsp(OID_ANDROID, SUB_SET_UID_AND_SAK, status);
    if !ctx.pump.post(Endpoint::Stack, &rsp, None) {
        error!("failed to send the UID/SAK response to the stack");
    }
    true
}

/// Registry hook turning firmware polling logs into android polling-frame
/// notifications. Always reports "not handled" so other firmware-log
/// consumers still see the same notification.
pub(crate) fn polling_frame(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let format = frame.get(3).copied().unwrap_or(0);
    let mut b = FrameBuilder::control(MT_NTF, GID_PROP, OID_ANDROID);
    b.u8(SUB_POLLING_FRAME_NTF);
    let mut produced = 0usize;

    let mut pos = 6usize;
    while pos + 2 <= frame.len() {
        let tlv_len = frame[pos + 1] as usize + 2;
        if pos + tlv_len > frame.len() {
            break;
        }
        let tlv = &frame[pos..pos + tlv_len];
        pos += tlv_len;

        let kind = tlv[0];
        let process = match kind {
            FWLOG_FIELD_ON | FWLOG_FIELD_OFF => {
                ctx.state.polling_in_ce = false;
                true
            }
            // Frames received after a card-emulation exchange started are
            // not polling-loop traffic.
            FWLOG_CE_RX | FWLOG_CE_RX_ERROR => !ctx.state.polling_in_ce,
            FWLOG_CE_TX | FWLOG_ACTIVE_A | FWLOG_SLEEP_A => {
                ctx.state.polling_in_ce = true;
                false
            }
            FWLOG_FIELD_LEVEL | FWLOG_IDLE => {
                ctx.state.polling_in_ce = false;
                false
            }
            _ => false,
        };
        if !process {
            continue;
        }

        let mut avail = tlv.len() as i32;
        let ts = if format & 0x01 == 0 || tlv.len() < 6 {
            0u32
        } else {
            avail -= 4;
            let at = tlv.len() - 4;
            let raw = u32::from_be_bytes([tlv[at], tlv[at + 1], tlv[at + 2], tlv[at + 3]]);
            scale_timestamp(format, raw)
        };

        match kind {
            FWLOG_FIELD_ON | FWLOG_FIELD_OFF => {
                b.u8(TAG_FIELD_CHANGE);
                b.u8(0x00); // flags
                b.u8(6); // fixed length
                b.bytes(&ts.to_be_bytes());
                b.u8(0xFF); // gain not applicable
                b.u8(if kind == FWLOG_FIELD_ON { 0x01 } else { 0x00 });
                produced += 1;
            }
            FWLOG_CE_RX | FWLOG_CE_RX_ERROR => {
                if emit_ce_rx_tlv(&mut b, format, kind, tlv, avail, ts) {
                    produced += 1;
                }
            }
            _ => {}
        }
    }

    if produced > 0 {
        if !ctx.pump.post(Endpoint::Stack, &b.finish(), None) {
            error!("failed to send a polling frame notification");
        }
    }
    // Other modules want the firmware log too.
    false
}

fn scale_timestamp(format: u8, ticks: u32) -> u32 {
    // Firmware ticks to microseconds, rounding half up in 64-bit space.
    if format & 0x30 == 0x30 {
        ((ticks as u64 * 1024 + 129) / 259) as u32
    } else {
        ((ticks as u64 * 128 + 14) / 28) as u32
    }
}

/// Decode one card-emulation receive record and append the matching
/// polling-frame TLV. Returns false when the record is too mangled to use.
fn emit_ce_rx_tlv(
    b: &mut FrameBuilder,
    format: u8,
    kind: u8,
    tlv: &[u8],
    mut avail: i32,
    ts: u32,
) -> bool {
    let mut flags = 0u8;
    let mut tag = match tlv.get(2).map(|v| v & 0x0F) {
        Some(0x1) => {
            flags |= 0x01; // short frame
            TAG_NFC_A
        }
        Some(0x2..=0x6) => TAG_NFC_A, // bit-oriented, standard, transparent, ...
        Some(0x7) => TAG_NFC_B,
        Some(0x8) | Some(0x9) => TAG_NFC_F,
        Some(0xA) => TAG_NFC_V,
        Some(0xB) => TAG_NFC_A, // enhanced
        Some(0xC) => TAG_NFC_B, // enhanced
        Some(0xD) => TAG_NFC_A, // unclassified
        _ => TAG_UNKNOWN,
    };

    // Layout after the bitrate/type byte depends on the chip family; it
    // always ends with a 16-bit real length and the captured bytes.
    let (gain, error_byte, len_at, overhead) = if format_oldest(format) {
        let gain = tlv.get(3).copied().unwrap_or(0xFF);
        if kind == FWLOG_CE_RX {
            (gain, 0u8, 4usize, 6i32)
        } else {
            (gain, tlv.get(4).copied().unwrap_or(0), 5, 7)
        }
    } else {
        let gain = tlv.get(3).map_or(0xFF, |v| (v & 0xF0) >> 4);
        if kind == FWLOG_CE_RX {
            if format_newest(format) {
                (0xFF, 0, 3, 5)
            } else {
                (gain, 0, 5, 7)
            }
        } else {
            (gain, tlv.get(5).copied().unwrap_or(0), 6, 8)
        }
    };
    avail -= overhead;

    let (Some(&hi), Some(&lo)) = (tlv.get(len_at), tlv.get(len_at + 1)) else {
        return false;
    };
    let mut real_len = u16::from_be_bytes([hi, lo]);

    if avail > 2 && real_len as i32 > avail {
        // The capture was truncated; the last two buffered bytes belong to
        // the tail of the frame, drop them.
        avail -= 2;
    }
    if error_byte != 0 {
        tag = TAG_UNKNOWN;
    }
    if format_middle(format) && flags & 0x01 != 0 && error_byte == 0 {
        // This family reports a bogus length on error-free short frames.
        real_len = 1;
    }
    if tag == TAG_NFC_A
        && real_len >= 1
        && !matches!(tlv.get(len_at + 2), Some(&0x26) | Some(&0x52))
    {
        // A type A frame that is neither REQA nor WUPA.
        tag = TAG_UNKNOWN;
    }
    if tag == TAG_NFC_B && real_len == 3 && tlv.get(len_at + 2) != Some(&0x05) {
        // A type B frame of REQB size that is not REQB.
        tag = TAG_UNKNOWN;
    }

    let avail = avail.max(0) as usize;
    let Some(data) = tlv.get(len_at + 2..len_at + 2 + avail) else {
        return false;
    };
    b.u8(tag);
    b.u8(flags);
    b.u8((5 + avail) as u8);
    b.bytes(&ts.to_be_bytes());
    b.u8(gain);
    b.bytes(data);
    true
}
