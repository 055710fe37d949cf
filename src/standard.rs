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

//! Rules for the standard NCI groups (core, rf-management, nfcee-management)
//! and for data packets.

use log::{debug, error, info};
use std::thread;
use std::time::{Duration, Instant};

use crate::packets::*;
use crate::pump::{Pump, WatchdogKind};
use crate::registry::RspHook;
use crate::vendor::{ESE_NFCEE_ID, OID_LIB, SUB_ACTIVATED_CUSTOM_POLL, SUB_EE_ACTION_AID_WITH_SW};
use crate::{Ctx, Endpoint};

/// Build and post a CORE_RESET_NTF that makes the stack restart NFC. The
/// hint rides in the trigger byte when it falls in the proprietary range.
pub(crate) fn send_recovery(pump: &Pump, hint: u8) -> bool {
    info!("generating a CORE_RESET_NTF (hint: {hint:#04x})");
    let mut b = FrameBuilder::control(MT_NTF, GID_CORE, CORE_RESET);
    b.u8(if hint >= 0xA0 { hint } else { 0x00 });
    b.u8(0x01); // configuration status
    b.u8(0x20); // NCI version
    b.u8(0x02); // manufacturer id
    b.u8(0x00); // no manufacturer data
    pump.post(Endpoint::Stack, &b.finish(), None)
}

pub(crate) fn process(
    ctx: &mut Ctx,
    inform_only: bool,
    from: Endpoint,
    frame: &[u8],
    hdr: &Header,
) -> bool {
    if inform_only {
        if hdr.mt == MT_NTF && hdr.gid == GID_CORE && hdr.oid == CORE_RESET {
            ctx.state.record_core_reset(frame);
        }
        return false;
    }

    if hdr.mt == MT_DATA {
        return process_data(ctx, from, frame, hdr);
    }

    match hdr.gid {
        GID_CORE => process_core(ctx, frame, hdr),
        GID_RF => process_rf(ctx, frame, hdr),
        GID_NFCEE => process_nfcee(ctx, frame, hdr),
        other => {
            error!("unexpected GID: {other:#04x}");
            false
        }
    }
}

fn process_data(ctx: &mut Ctx, from: Endpoint, frame: &[u8], hdr: &Header) -> bool {
    let mut handled = false;
    // The gid bits carry the connection id for data packets.
    if hdr.gid == RF_CONN_ID {
        if from == Endpoint::Stack {
            ctx.state.last_rf_tx = Some(Instant::now());
            if ctx.state.is_reader_activation && hdr.len == 0 {
                ctx.state.tx_empty_iframe = true;
            }
        } else {
            ctx.state.last_rf_tx = None;
            if ctx.state.is_reader_activation && hdr.len == 0 {
                if ctx.state.tx_empty_iframe {
                    ctx.state.tx_empty_iframe = false;
                } else {
                    // The firmware emits one empty I-frame we did not ask for.
                    debug!("discard received empty I-frame (not a presence check)");
                    handled = true;
                }
            }
        }
    }
    handled
}

fn process_core(ctx: &mut Ctx, frame: &[u8], hdr: &Header) -> bool {
    let mut handled = false;
    match hdr.oid {
        CORE_RESET => {
            if hdr.mt == MT_NTF {
                ctx.state.record_core_reset(frame);
            }
        }

        CORE_GENERIC_ERROR if hdr.mt == MT_NTF => {
            let Some(&status) = frame.get(3) else {
                error!("CORE_GENERIC_ERROR_NTF length too short: {}", frame.len());
                return false;
            };
            match status {
                STATUS_ACTIVATION_FAILED => {
                    ctx.pump.watchdog_remove(WatchdogKind::FieldOnTooLong);
                }
                STATUS_PROP_BUFFER_OVERFLOW => {
                    error!("NFCC receive buffer overflow, trigger recovery to resync state");
                    handled = send_recovery(ctx.pump, STATUS_PROP_BUFFER_OVERFLOW);
                }
                STATUS_PROP_PLL_LOCK_ISSUE => {
                    if ctx.state.hw_version() == crate::state::HW_FAMILY_OLDEST {
                        error!("PLL lock error this chip cannot recover from, trigger recovery");
                        handled = send_recovery(ctx.pump, STATUS_PROP_PLL_LOCK_ISSUE);
                    }
                }
                _ => {}
            }
        }

        CORE_SET_POWER_SUB_STATE if hdr.mt == MT_CMD => {
            let Some(&target) = frame.get(3) else {
                error!("CORE_SET_POWER_SUB_STATE length too short: {}", frame.len());
                return false;
            };
            // Going to screen off while a tag exchange is running: make sure
            // the power monitor eventually reports the exchange finished.
            if ctx.state.settings.activerw_timer
                && (target == 0x01 || target == 0x03)
                && ctx.state.pwr_mon_active_rw
                && !ctx.pump.watchdog_add(WatchdogKind::ActiveRwTooLong, 5000)
            {
                error!("failed to add the active read/write watchdog, continue");
            }
        }

        CORE_CONN_CREDITS if hdr.mt == MT_NTF => {
            if frame.len() >= 6
                && frame[4] == HCI_CONN_ID
                && ctx.state.hci_lent_credits > 0
            {
                ctx.state.hci_lent_credits -= 1;
                if frame[5] <= 1 {
                    // The whole credit was lent by us, absorb it.
                    handled = true;
                } else {
                    let mut b = FrameBuilder::control(MT_NTF, GID_CORE, CORE_CONN_CREDITS);
                    b.u8(frame[3]);
                    b.u8(frame[4]);
                    b.u8(frame[5] - 1);
                    handled = ctx.pump.post(Endpoint::Stack, &b.finish(), None);
                }
            }
        }

        _ => {}
    }
    handled
}

fn process_rf(ctx: &mut Ctx, frame: &[u8], hdr: &Header) -> bool {
    let mut handled = false;
    match hdr.oid {
        RF_SET_ROUTING if hdr.mt == MT_CMD => {
            handled = rewrite_routing(ctx, frame);
        }

        RF_DISCOVER if hdr.mt == MT_NTF => {
            ctx.pump.watchdog_remove(WatchdogKind::FieldOnTooLong);
            ctx.pump.watchdog_remove(WatchdogKind::ActiveRwTooLong);
            ctx.state.pwr_mon_errors = 0;
        }

        RF_INTF_ACTIVATED if hdr.mt == MT_NTF => {
            ctx.pump.watchdog_remove(WatchdogKind::FieldOnTooLong);
            ctx.pump.watchdog_remove(WatchdogKind::ActiveRwTooLong);
            ctx.state.pwr_mon_errors = 0;

            let Some(&disc_type) = frame.get(6) else { return false };
            ctx.state.is_reader_activation = disc_type < DISCOVERY_TYPE_LISTEN_A;
            if disc_type == CUST_PASSIVE_POLL_MODE {
                handled = split_custom_poll_activation(ctx, frame);
            }
        }

        RF_DEACTIVATE if hdr.mt == MT_CMD => {
            // The firmware needs a quiet gap between the last RF exchange and
            // a deactivation.
            if let Some(last) = ctx.state.last_rf_tx.take() {
                let deadline = last + Duration::from_millis(10);
                let now = Instant::now();
                if deadline > now {
                    let wait = deadline - now;
                    debug!("waiting {}ms before sending the deactivate cmd", wait.as_millis());
                    thread::sleep(wait);
                }
            }
        }

        RF_FIELD_INFO if hdr.mt == MT_NTF => {
            let Some(&on) = frame.get(3) else {
                error!("RF_FIELD_INFO_NTF length too short: {}", frame.len());
                return false;
            };
            if on == 0x01 {
                if ctx.state.hw_version() >= crate::state::HW_FAMILY_MIDDLE
                    && ctx.state.settings.field_timer
                    && !ctx.pump.watchdog_add(WatchdogKind::FieldOnTooLong, 20_000)
                {
                    error!("failed to add the field watchdog, continue");
                }
            } else {
                ctx.pump.watchdog_remove(WatchdogKind::FieldOnTooLong);
            }
        }

        RF_EE_ACTION if hdr.mt == MT_NTF => {
            handled = remap_ee_action(ctx, frame);
        }

        RF_EE_DISCOVERY_REQ if hdr.mt == MT_NTF => {
            if frame.len() <= 8 {
                error!("RF_EE_DISCOVERY_REQ_NTF length too short: {}", frame.len());
                return false;
            }
            let entries = frame[3] as usize;
            for i in 0..entries {
                let base = 4 + i * 5;
                let (Some(&op), Some(&id), Some(&tech), Some(&proto)) = (
                    frame.get(base),
                    frame.get(base + 2),
                    frame.get(base + 3),
                    frame.get(base + 4),
                ) else {
                    break;
                };
                ctx.state.fold_ee_discovery(op == 0x00, id, tech, proto);
            }
            for e in &ctx.state.ee_info {
                debug!(
                    "nfcee {:#04x}: la={:#04x} lb={:#04x} lf={:#04x}",
                    e.nfcee_id, e.listen_a, e.listen_b, e.listen_f
                );
            }
        }

        _ => {}
    }
    handled
}

/// Rewrite the listen-technology routes before the command reaches the NFCC.
fn rewrite_routing(ctx: &mut Ctx, frame: &[u8]) -> bool {
    let entries = frame.get(4).copied().unwrap_or(0) as usize;
    let mut idx = 5usize;
    let (mut idx_a, mut idx_b, mut idx_f) = (0usize, 0usize, 0usize);
    let (mut route_a, mut route_b, mut route_f) = (0u8, 0u8, 0u8);
    for _ in 0..entries {
        let (Some(&etype), Some(&elen)) = (frame.get(idx), frame.get(idx + 1)) else { break };
        if etype & 0x0F == 0x00 {
            if let (Some(&route), Some(&tech)) = (frame.get(idx + 2), frame.get(idx + 4)) {
                match tech {
                    RF_TECHNOLOGY_A => (idx_a, route_a) = (idx, route),
                    RF_TECHNOLOGY_B => (idx_b, route_b) = (idx, route),
                    RF_TECHNOLOGY_F => (idx_f, route_f) = (idx, route),
                    _ => {}
                }
            }
        }
        idx += elen as usize + 2;
    }

    let mut out = frame.to_vec();
    if ctx.state.is_card_a_on {
        debug!("routing tech A/B to the NDEF NFCEE");
        for at in [idx_a, idx_b] {
            if at != 0 && at + 4 < out.len() {
                out[at + 2] = 0x10; // NDEF NFCEE
                out[at + 3] = 0x3B; // all power states
            }
        }
    } else {
        if route_a != route_b && idx_a != 0 && idx_b != 0 {
            debug!(
                "route_a={route_a:#04x}, route_b={route_b:#04x}, not same route, block tech routed to DH"
            );
            // A zero route means the technology was not supported by the
            // original route; that is the entry to block.
            let at = if route_a == 0x00 { idx_a } else { idx_b };
            if at + 4 < out.len() {
                out[at] |= 0x40;
                out[at + 3] = 0x00; // no power states allowed
            }
        }
        if !ctx.state.ese_felica_enabled
            && route_f == ESE_NFCEE_ID
            && idx_f != 0
            && idx_f + 4 < out.len()
        {
            debug!("routing tech F to the DH");
            out[idx_f + 2] = 0x00; // DH
            out[idx_f + 3] = 0x11; // switched on, screen unlocked
        }
    }
    ctx.pump.post(Endpoint::Nfcc, &out, None)
}

/// A custom-poll activation gets reported once on the proprietary opcode and
/// then replayed as a standard activation with the technology rewritten.
fn split_custom_poll_activation(ctx: &mut Ctx, frame: &[u8]) -> bool {
    if !ctx.state.rf_intf_cust_tx {
        let mut b = FrameBuilder::control(MT_NTF, GID_PROP, OID_LIB);
        b.u8(SUB_ACTIVATED_CUSTOM_POLL);
        b.bytes(&frame[3..]);
        if !ctx.pump.post(Endpoint::Stack, &b.finish(), None) {
            error!("failed to post notification, stop processing the activation");
            return false;
        }
        ctx.state.rf_intf_cust_tx = true;
    }

    let payload_len = frame[2] as usize;
    let (Some(&protocol), Some(&params_len), Some(&reported_tech)) =
        (frame.get(5), frame.get(9), frame.get(10))
    else {
        error!("custom poll activation too short: {}", frame.len());
        return false;
    };
    let params_len = (params_len as usize).saturating_sub(2);
    let tech_mode = if protocol != PROTOCOL_UNDETERMINED {
        // The real technology is embedded in the parameters.
        reported_tech
    } else {
        match reported_tech {
            PROP_A_POLL => DISCOVERY_TYPE_POLL_A,
            PROP_B_POLL | PROP_B_NOEOFSOF_POLL | PROP_B_NOSOF_POLL => DISCOVERY_TYPE_POLL_B,
            PROP_F_POLL => DISCOVERY_TYPE_POLL_F,
            PROP_V_POLL => DISCOVERY_TYPE_POLL_V,
            other => {
                error!("unknown RF tech mode: {other:#04x}");
                DISCOVERY_TYPE_POLL_A
            }
        }
    };
    if frame.len() < 13 + params_len {
        error!("custom poll activation too short: {}", frame.len());
        return false;
    }
    let mut b = FrameBuilder::control(MT_NTF, GID_RF, RF_INTF_ACTIVATED);
    b.u8(frame[3]); // discovery id
    b.u8(frame[4]); // interface
    b.u8(frame[5]); // protocol
    b.u8(tech_mode);
    b.u8(frame[7]); // max data payload size
    b.u8(frame[8]); // initial credits
    b.u8(params_len as u8);
    b.bytes(&frame[12..12 + params_len]);
    b.u8(tech_mode); // data exchange technology and mode
    let tail_at = 13 + params_len;
    let tail_len = payload_len.saturating_sub(10 + params_len);
    let tail_end = (tail_at + tail_len).min(frame.len());
    b.bytes(&frame[tail_at..tail_end]);
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

/// Proprietary "AID with status word" triggers become one proprietary
/// notification plus a standard AID-triggered EE action.
fn remap_ee_action(ctx: &mut Ctx, frame: &[u8]) -> bool {
    if frame.len() < 6 {
        error!("RF_EE_ACTION_NTF length too short: {}", frame.len());
        return false;
    }
    if frame[4] != 0x11 {
        return false;
    }

    let mut b = FrameBuilder::control(MT_NTF, GID_PROP, OID_LIB);
    b.u8(SUB_EE_ACTION_AID_WITH_SW);
    b.bytes(&frame[3..]);
    if !ctx.pump.post(Endpoint::Stack, &b.finish(), None) {
        error!("failed to post notification, stop processing RF_EE_ACTION_NTF");
        return false;
    }

    let Some(&aid_len) = frame.get(7) else {
        error!("RF_EE_ACTION_NTF has no AID");
        return false;
    };
    let aid_end = (8 + aid_len as usize).min(frame.len());
    let mut b = FrameBuilder::control(MT_NTF, GID_RF, RF_EE_ACTION);
    b.u8(frame[3]); // NFCEE id
    b.u8(0x00); // trigger: force AID
    b.bytes(&frame[7..aid_end]); // AID length + AID
    ctx.pump.post(Endpoint::Stack, &b.finish(), None)
}

fn process_nfcee(ctx: &mut Ctx, frame: &[u8], hdr: &Header) -> bool {
    let mut handled = false;
    match hdr.oid {
        NFCEE_MODE_SET => {
            if hdr.mt == MT_CMD {
                let (Some(&id), Some(&enable)) = (frame.get(3), frame.get(4)) else {
                    error!("NFCEE_MODE_SET_CMD length too short: {}", frame.len());
                    return false;
                };
                info!("NFCEE_MODE_SET_CMD: nfcee={id:#04x}");
                if enable == 0x01 {
                    ctx.state.wait_nfcee_ntf = true;
                }
                ctx.state.waiting_nfcee_id = id;
            } else if hdr.mt == MT_NTF {
                if frame.get(3) == Some(&STATUS_OK) {
                    info!("NFCEE_MODE_SET_NTF: activation={}", ctx.state.wait_nfcee_ntf);
                    let activated = ctx.state.wait_nfcee_ntf;
                    ctx.state.nfcee_mode_set_result();
                    if activated && ctx.state.waiting_nfcee_id == ESE_NFCEE_ID {
                        // Keep the SWP link always powered for the secure
                        // element; the response is ours to consume.
                        let mut b =
                            FrameBuilder::control(MT_CMD, GID_NFCEE, NFCEE_POWER_LINK_CTRL);
                        b.u8(ctx.state.waiting_nfcee_id);
                        b.u8(0x03); // always on
                        let _ = ctx.pump.post(Endpoint::Nfcc, &b.finish(), Some(RspHook::Block));
                    }
                }
                ctx.state.wait_nfcee_ntf = false;
                if ctx.state.ese.stuck {
                    // The stuck-element recovery owns this exchange.
                    handled = true;
                }
            }
        }

        NFCEE_POWER_LINK_CTRL if hdr.mt == MT_CMD => {
            // The firmware manages the power link itself; answer on its behalf.
            let mut b = FrameBuilder::control(MT_RSP, GID_NFCEE, NFCEE_POWER_LINK_CTRL);
            b.u8(STATUS_OK);
            handled = ctx.pump.post(Endpoint::Stack, &b.finish(), None);
        }

        _ => {}
    }
    handled
}
