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

//! End-to-end scenarios driven through the public entry points, with the
//! outbound callback captured on a channel.

use nci_shim::{Endpoint, NciShim};
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::time::Duration;

const ABNORMAL_RESET: [u8; 8] = [0x60, 0x00, 0x05, 0x00, 0x01, 0x20, 0x02, 0x00];

fn shim() -> (NciShim, Receiver<(Endpoint, Vec<u8>)>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let shim = NciShim::new(2, move |to, frame: &[u8]| {
        tx.lock().unwrap().send((to, frame.to_vec())).ok();
    })
    .expect("shim init");
    (shim, rx)
}

fn recv(rx: &Receiver<(Endpoint, Vec<u8>)>) -> (Endpoint, Vec<u8>) {
    rx.recv_timeout(Duration::from_secs(2)).expect("expected an outbound frame")
}

fn assert_idle(rx: &Receiver<(Endpoint, Vec<u8>)>) {
    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "unexpected outbound frame"
    );
}

/// CORE_RESET_NTF carrying manufacturer info for the given chip identity.
fn reset_ntf(hw: u8, fw_major: u8, fw_minor: u8) -> Vec<u8> {
    let info = [hw, 0x00, fw_major, fw_minor, 0x00, 0x01, 0x00, 0x00, 0x00];
    let mut f = vec![0x60, 0x00, 0x00, 0x02, 0x01, 0x20, 0x02, info.len() as u8];
    f.extend_from_slice(&info);
    f[2] = (f.len() - 3) as u8;
    f
}

/// Negotiate capabilities against a newest-family firmware that supports
/// everything; leaves the shim in per-technology observe mode.
fn negotiate_full_caps(shim: &NciShim, rx: &Receiver<(Endpoint, Vec<u8>)>) {
    shim.inform(Endpoint::Nfcc, &reset_ntf(0x06, 0x02, 0x06));
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x0C, 0x01, 0x00]));
    let (to, caps) = recv(rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(caps[..5], [0x4F, 0x0C, 0x17, 0x00, 0x00]);
}

#[test]
fn get_caps_for_full_featured_firmware() {
    let (shim, rx) = shim();
    shim.inform(Endpoint::Nfcc, &reset_ntf(0x06, 0x02, 0x06));
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x0C, 0x01, 0x00]));
    let (to, caps) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(
        caps,
        vec![
            0x4F, 0x0C, 0x17, // header
            0x00, 0x00, // get-caps, ok
            0x00, 0x00, // version word
            0x06, // six TLVs
            0x00, 0x01, 0x02, // observe without deactivation
            0x01, 0x01, 0x01, // polling frames supported
            0x02, 0x01, 0x00, // no power saving
            0x03, 0x01, 0x01, // exit frames supported
            0x04, 0x01, 0x0A, // ten exit frame entries
            0x05, 0x01, 0x01, // reader annotations supported
        ]
    );
}

#[test]
fn get_caps_for_older_firmware_is_conservative() {
    let (shim, rx) = shim();
    shim.inform(Endpoint::Nfcc, &reset_ntf(0x05, 0x03, 0x00));
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x0C, 0x01, 0x00]));
    let (_, caps) = recv(&rx);
    assert_eq!(
        caps,
        vec![
            0x4F, 0x0C, 0x17, 0x00, 0x00, 0x00, 0x00, 0x06, //
            0x00, 0x01, 0x01, // observe needs deactivation
            0x01, 0x01, 0x01, //
            0x02, 0x01, 0x00, //
            0x03, 0x01, 0x00, // no exit frames
            0x04, 0x01, 0x00, //
            0x05, 0x01, 0x00, // no annotations
        ]
    );
}

#[test]
fn get_caps_before_identity_reports_not_initialized() {
    let (shim, rx) = shim();
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x0C, 0x01, 0x00]));
    let (_, rsp) = recv(&rx);
    assert_eq!(rsp, vec![0x4F, 0x0C, 0x02, 0x00, 0x04]);
}

// Scenario S1: observe-mode query with the per-technology encoding.
#[test]
fn observe_query_new_encoding() {
    let (shim, rx) = shim();
    negotiate_full_caps(&shim, &rx);

    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x0C, 0x02, 0x04, 0x01]));
    let (to, cmd) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(cmd, vec![0x21, 0x17, 0x00]);

    assert!(shim.process(Endpoint::Nfcc, &[0x41, 0x17, 0x02, 0x00, 0x03]));
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x4F, 0x0C, 0x03, 0x04, 0x00, 0x03]);
}

#[test]
fn observe_enable_legacy_encoding() {
    let (shim, rx) = shim();
    // No capability negotiation: the config-based encoding is the default.
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x0C, 0x02, 0x02, 0x01]));
    let (to, cmd) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(cmd, vec![0x20, 0x02, 0x04, 0x01, 0xA3, 0x01, 0x01]);

    assert!(shim.process(Endpoint::Nfcc, &[0x40, 0x02, 0x02, 0x00, 0x00]));
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x4F, 0x0C, 0x02, 0x02, 0x00]);
}

// Scenario S2: exit-frame translation with CRC injection.
#[test]
fn exit_frame_translation_injects_crc() {
    let (shim, rx) = shim();
    let cmd = [
        0x2F, 0x0C, 0x0A, // header
        0x11, // set exit frame
        0x00, // more
        0x64, 0x00, // timeout 100 ms
        0x01, // one entry
        0x00, // tech A, full match, with response
        0x03, // value length
        0x00, // power state
        0x26, // REQA
        0xFF, // exact-match mask
    ];
    assert!(shim.process(Endpoint::Stack, &cmd));
    let (to, translated) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(
        translated,
        vec![
            0x2F, 0x19, 0x0D, // vendor exit-frame command
            0x00, // more
            0x64, 0x00, // timeout
            0x01, // one entry
            0x00, 0x03, // qualifier, value length
            0x00, // power state
            0x26, 0xCA, 0x15, // data plus CRC-A of REQA
            0xFF, 0xFF, 0xFF, // mask plus exact CRC mask
        ]
    );

    assert!(shim.process(Endpoint::Nfcc, &[0x4F, 0x19, 0x01, 0x00]));
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x4F, 0x0C, 0x02, 0x11, 0x00]);
}

#[test]
fn exit_frame_below_minimum_timeout_is_clamped() {
    let (shim, rx) = shim();
    let cmd = [0x2F, 0x0C, 0x08, 0x11, 0x00, 0x10, 0x00, 0x01, 0x02, 0x01, 0x00];
    // One type F entry, no CRC handling, timeout 16 ms.
    assert!(shim.process(Endpoint::Stack, &cmd));
    let (_, translated) = recv(&rx);
    assert_eq!(&translated[3..6], &[0x00, 0x64, 0x00]);
}

// Scenario S4: ack matching with retransmit-then-give-up on data.
#[test]
fn lost_data_is_retransmitted_then_recovered() {
    let (shim, rx) = shim();
    let data = [0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC];
    assert!(shim.process(Endpoint::Stack, &data));

    let (to, first) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(first, data.to_vec());

    // No credit arrives: the same frame goes out once more after ~700 ms.
    let (to, second) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(second, data.to_vec());

    // Still no credit: the stack is asked to restart.
    let (to, recovery) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(recovery, ABNORMAL_RESET.to_vec());
    assert_idle(&rx);
}

// Scenario S5: the passthrough gate.
#[test]
fn passthrough_gate_toggles() {
    let (shim, rx) = shim();
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x01, 0x02, 0x00, 0x01]));
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x4F, 0x01, 0x02, 0x00, 0x00]);

    // While passthrough is on, stack traffic is not handled.
    assert!(!shim.process(Endpoint::Stack, &[0x20, 0x00, 0x01, 0x00]));
    assert_idle(&rx);

    // Controller traffic is still pumped upward for the bookkeeping.
    assert!(shim.process(Endpoint::Nfcc, &[0x40, 0x00, 0x01, 0x00]));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(fwd, vec![0x40, 0x00, 0x01, 0x00]);

    // The disable command is the one thing still intercepted.
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x01, 0x02, 0x00, 0x00]));
    let (_, rsp) = recv(&rx);
    assert_eq!(rsp, vec![0x4F, 0x01, 0x02, 0x00, 0x00]);

    // Back to normal: unhandled frames are forwarded by the pump again.
    assert!(shim.process(Endpoint::Stack, &[0x20, 0x00, 0x01, 0x00]));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(fwd, vec![0x20, 0x00, 0x01, 0x00]);
}

// Scenario S6 and the APDU gate path: pipe discovery, transceive, credit
// lending.
#[test]
fn apdu_gate_transceive_and_credit_lending() {
    let (shim, rx) = shim();

    // The stack fetches the pipe table; the answer reveals the APDU gate.
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x02, 0x02, 0x03, 0x0B]));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(fwd, vec![0x2F, 0x02, 0x02, 0x03, 0x0B]);

    let pipe_table = [
        0x4F, 0x02, 0x10, // header
        0x00, 0x00, 0x00, // status, padding
        0x0C, // 12 bytes of entries
        0x00, 0xF0, 0x00, 0x00, // entry: gate 0xF0
        0x21, 0x06, // pipe 0x21, state open
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    assert!(shim.process(Endpoint::Nfcc, &pipe_table));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(fwd, pipe_table.to_vec());

    // Transceive: one HCI fragment goes down, the status reply comes back.
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x01, 0x06, 0x05, 0x00, 0xA4, 0x04, 0x00, 0x00]));
    let (to, fragment) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(fragment, vec![0x01, 0x00, 0x07, 0xA1, 0x90, 0x00, 0xA4, 0x04, 0x00, 0x00]);
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x4F, 0x01, 0x02, 0x05, 0x00]);

    // A credit of one was lent by the fragment: absorb the notification.
    assert!(shim.process(Endpoint::Nfcc, &[0x60, 0x06, 0x03, 0x01, 0x01, 0x01]));
    assert_idle(&rx);

    // The element answers; the completed frame surfaces as a notification.
    assert!(shim.process(Endpoint::Nfcc, &[0x01, 0x00, 0x04, 0xA1, 0x90, 0x90, 0x00]));
    let (to, ntf) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(ntf, vec![0x6F, 0x01, 0x04, 0x05, 0x00, 0x90, 0x00]);

    // Second exchange, but this time the credit notification grants two:
    // one is ours, the rest flows on with the count decremented.
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x01, 0x03, 0x05, 0x00, 0xB2]));
    let (_, _fragment) = recv(&rx);
    let (_, _rsp) = recv(&rx);
    assert!(shim.process(Endpoint::Nfcc, &[0x60, 0x06, 0x03, 0x01, 0x01, 0x02]));
    let (to, credit) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(credit, vec![0x60, 0x06, 0x03, 0x01, 0x01, 0x01]);
}

#[test]
fn ee_action_aid_with_sw_is_remapped() {
    let (shim, rx) = shim();
    let ntf = [
        0x61, 0x09, 0x0B, // header
        0x86, // NFCEE id
        0x11, // vendor trigger: AID with status word
        0x09, 0x00, // trigger data
        0x04, 0xA0, 0x00, 0x00, 0x01, // AID length + AID
        0x90, 0x00, // status word
    ];
    assert!(shim.process(Endpoint::Nfcc, &ntf));

    let (to, prop) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(
        prop,
        vec![
            0x6F, 0x01, 0x0C, 0x06, // proprietary notification
            0x86, 0x11, 0x09, 0x00, 0x04, 0xA0, 0x00, 0x00, 0x01, 0x90, 0x00,
        ]
    );

    let (to, standard) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(
        standard,
        vec![0x61, 0x09, 0x07, 0x86, 0x00, 0x04, 0xA0, 0x00, 0x00, 0x01]
    );
}

#[test]
fn power_link_ctrl_is_answered_locally() {
    let (shim, rx) = shim();
    assert!(shim.process(Endpoint::Stack, &[0x22, 0x03, 0x02, 0x86, 0x03]));
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x42, 0x03, 0x01, 0x00]);
    assert_idle(&rx);
}

#[test]
fn observe_suspend_is_translated_when_exit_frames_are_off() {
    let (shim, rx) = shim();
    // Motif 26 01 followed by its two CRC bytes, which must be dropped.
    assert!(shim.process(Endpoint::Nfcc, &[0x6F, 0x1B, 0x06, 0x01, 0x04, 0x26, 0x01, 0xCA, 0x15]));
    let (to, ntf) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(ntf, vec![0x6F, 0x0C, 0x05, 0x13, 0x01, 0x02, 0x26, 0x01]);

    assert!(shim.process(Endpoint::Nfcc, &[0x6F, 0x1C, 0x00]));
    let (_, ntf) = recv(&rx);
    assert_eq!(ntf, vec![0x6F, 0x0C, 0x01, 0x14]);
}

#[test]
fn observe_suspend_is_swallowed_after_capability_negotiation() {
    let (shim, rx) = shim();
    negotiate_full_caps(&shim, &rx);
    assert!(shim.process(Endpoint::Nfcc, &[0x6F, 0x1B, 0x06, 0x01, 0x04, 0x26, 0x01, 0xCA, 0x15]));
    assert!(shim.process(Endpoint::Nfcc, &[0x6F, 0x1C, 0x00]));
    assert_idle(&rx);
}

#[test]
fn annotation_after_custom_poll_frame_is_idempotent() {
    let (shim, rx) = shim();

    // Install a custom poll frame through the extension command.
    assert!(shim.process(Endpoint::Stack, &[0x2F, 0x01, 0x07, 0x13, 0x01, 0x20, 0x03, 0x8A, 0x26, 0x01]));
    let (to, translated) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(&translated[..3], &[0x2F, 0x1D, 0x08]);
    // Length grew by the two injected CRC bytes.
    assert_eq!(translated[5], 0x05);
    assert_eq!(translated.len(), 11);
    assert!(shim.process(Endpoint::Nfcc, &[0x4F, 0x1D, 0x01, 0x00]));
    let (_, rsp) = recv(&rx);
    assert_eq!(rsp, vec![0x4F, 0x01, 0x02, 0x13, 0x00]);

    // The annotation command now succeeds without touching the controller.
    let annotation = [0x2F, 0x0C, 0x09, 0x15, 0x01, 0x20, 0x05, 0x0A, 0x26, 0x01, 0x00, 0x00];
    assert!(shim.process(Endpoint::Stack, &annotation));
    let (to, rsp) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(rsp, vec![0x4F, 0x0C, 0x02, 0x15, 0x00]);
    assert_idle(&rx);
}

#[test]
fn power_monitor_off_storm_triggers_recovery() {
    let (shim, rx) = shim();
    for _ in 0..20 {
        assert!(shim.process(Endpoint::Nfcc, &[0x6F, 0x06, 0x00]));
        assert_idle(&rx);
    }
    assert!(shim.process(Endpoint::Nfcc, &[0x6F, 0x06, 0x00]));
    let (to, recovery) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(recovery, ABNORMAL_RESET.to_vec());
}

#[test]
fn polling_frame_field_event_is_synthesized() {
    let (shim, rx) = shim();
    negotiate_full_caps(&shim, &rx);

    // Firmware log, newest family with timestamps, one field-on record.
    let log = [
        0x6F, 0x02, 0x09, // header
        0x31, 0x20, 0x00, // format, log sub-opcode, counter
        0x10, 0x04, 0x00, 0x00, 0x01, 0x00, // field-on, ts=256 ticks
    ];
    assert!(shim.process(Endpoint::Nfcc, &log));
    let (to, ntf) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(
        ntf,
        vec![
            0x6F, 0x0C, 0x0A, // header
            0x03, // polling frame notification
            0x00, 0x00, 0x06, // field change TLV
            0x00, 0x00, 0x03, 0xF4, // 256 ticks scaled to microseconds
            0xFF, // gain
            0x01, // field on
        ]
    );
}

#[test]
fn unknown_stack_response_is_sent_through() {
    let (shim, rx) = shim();
    assert!(shim.process(Endpoint::Stack, &[0x41, 0x3F, 0x01, 0x00]));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(fwd, vec![0x41, 0x3F, 0x01, 0x00]);
}

#[test]
fn empty_i_frame_after_reader_activation_is_discarded_once() {
    let (shim, rx) = shim();
    // Poll-side activation (discovery type below the listen range).
    let activated = [
        0x61, 0x05, 0x09, // header
        0x01, 0x02, 0x04, 0x00, // id, interface, protocol, poll A
        0xFF, 0x01, 0x00, // payload size, credits, no parameters
        0x00, 0x00, // data exchange bytes
    ];
    assert!(shim.process(Endpoint::Nfcc, &activated));
    let (_, fwd) = recv(&rx);
    assert_eq!(fwd, activated.to_vec());

    // The firmware's spontaneous empty I-frame is dropped...
    assert!(shim.process(Endpoint::Nfcc, &[0x00, 0x00, 0x00]));
    assert_idle(&rx);

    // ...but one that answers our own empty I-frame flows through.
    assert!(shim.process(Endpoint::Stack, &[0x00, 0x00, 0x00]));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Nfcc);
    assert_eq!(fwd, vec![0x00, 0x00, 0x00]);
    assert!(shim.process(Endpoint::Nfcc, &[0x00, 0x00, 0x00]));
    let (to, fwd) = recv(&rx);
    assert_eq!(to, Endpoint::Stack);
    assert_eq!(fwd, vec![0x00, 0x00, 0x00]);
}
