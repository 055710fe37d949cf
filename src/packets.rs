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

//! NCI packet header codec and frame construction helpers.
//!
//! Control packets: `b0 = mt << 5 | pbf << 4 | gid`, `b1 = oid`,
//! `b2 = payload length`. Data packets reuse the gid bits as the connection
//! id and keep a single length byte (this layer never emits the extended
//! 16-bit data length).

use bytes::{BufMut, BytesMut};
use log::error;
use thiserror::Error;

pub(crate) const MT_DATA: u8 = 0;
pub(crate) const MT_CMD: u8 = 1;
pub(crate) const MT_RSP: u8 = 2;
pub(crate) const MT_NTF: u8 = 3;

pub(crate) const MT_SHIFT: u8 = 5;
pub(crate) const PBF_MASK: u8 = 0x10;
pub(crate) const GID_MASK: u8 = 0x0F;
pub(crate) const OID_MASK: u8 = 0x3F;

pub(crate) const GID_CORE: u8 = 0x0;
pub(crate) const GID_RF: u8 = 0x1;
pub(crate) const GID_NFCEE: u8 = 0x2;
pub(crate) const GID_PROP: u8 = 0xF;

pub(crate) const CORE_RESET: u8 = 0x00;
pub(crate) const CORE_SET_CONFIG: u8 = 0x02;
pub(crate) const CORE_GET_CONFIG: u8 = 0x03;
pub(crate) const CORE_CONN_CREDITS: u8 = 0x06;
pub(crate) const CORE_GENERIC_ERROR: u8 = 0x07;
pub(crate) const CORE_SET_POWER_SUB_STATE: u8 = 0x09;

pub(crate) const RF_SET_ROUTING: u8 = 0x01;
pub(crate) const RF_DISCOVER: u8 = 0x03;
pub(crate) const RF_INTF_ACTIVATED: u8 = 0x05;
pub(crate) const RF_DEACTIVATE: u8 = 0x06;
pub(crate) const RF_FIELD_INFO: u8 = 0x07;
pub(crate) const RF_EE_ACTION: u8 = 0x09;
pub(crate) const RF_EE_DISCOVERY_REQ: u8 = 0x0A;
pub(crate) const RF_SET_LISTEN_OBSERVE_MODE: u8 = 0x16;
pub(crate) const RF_GET_LISTEN_OBSERVE_MODE_STATE: u8 = 0x17;

pub(crate) const NFCEE_MODE_SET: u8 = 0x01;
pub(crate) const NFCEE_POWER_LINK_CTRL: u8 = 0x03;

pub(crate) const STATUS_OK: u8 = 0x00;
pub(crate) const STATUS_MESSAGE_CORRUPTED: u8 = 0x02;
pub(crate) const STATUS_FAILED: u8 = 0x03;
pub(crate) const STATUS_NOT_INITIALIZED: u8 = 0x04;
pub(crate) const STATUS_NOT_SUPPORTED: u8 = 0x0B;
pub(crate) const STATUS_ACTIVATION_FAILED: u8 = 0xA1;
/// Controller-specific: receive buffer overflowed, host was not fast enough.
pub(crate) const STATUS_PROP_BUFFER_OVERFLOW: u8 = 0xE1;
/// Controller-specific: reference clock PLL failed to lock.
pub(crate) const STATUS_PROP_PLL_LOCK_ISSUE: u8 = 0xE6;

pub(crate) const RF_CONN_ID: u8 = 0x00;
pub(crate) const HCI_CONN_ID: u8 = 0x01;

pub(crate) const DISCOVERY_TYPE_LISTEN_A: u8 = 0x80;
pub(crate) const DISCOVERY_TYPE_LISTEN_B: u8 = 0x81;
pub(crate) const DISCOVERY_TYPE_LISTEN_F: u8 = 0x82;
pub(crate) const DISCOVERY_TYPE_POLL_A: u8 = 0x00;
pub(crate) const DISCOVERY_TYPE_POLL_B: u8 = 0x01;
pub(crate) const DISCOVERY_TYPE_POLL_F: u8 = 0x02;
pub(crate) const DISCOVERY_TYPE_POLL_V: u8 = 0x06;
/// Discovery type reported when a custom passive poll frame matched.
pub(crate) const CUST_PASSIVE_POLL_MODE: u8 = 0x78;

pub(crate) const PROP_A_POLL: u8 = 0x80;
pub(crate) const PROP_B_POLL: u8 = 0x81;
pub(crate) const PROP_F_POLL: u8 = 0x82;
pub(crate) const PROP_V_POLL: u8 = 0x83;
pub(crate) const PROP_B_NOEOFSOF_POLL: u8 = 0x84;
pub(crate) const PROP_B_NOSOF_POLL: u8 = 0x85;

pub(crate) const PROTOCOL_UNDETERMINED: u8 = 0x00;
pub(crate) const PROTOCOL_T2T: u8 = 0x02;
pub(crate) const PROTOCOL_ISO_DEP: u8 = 0x04;

pub(crate) const RF_TECHNOLOGY_A: u8 = 0x00;
pub(crate) const RF_TECHNOLOGY_B: u8 = 0x01;
pub(crate) const RF_TECHNOLOGY_F: u8 = 0x02;

pub(crate) const HDR_SIZE: usize = 3;
pub(crate) const MAX_PAYLOAD: usize = 255;
pub(crate) const MAX_MSG_LEN: usize = HDR_SIZE + MAX_PAYLOAD;

/// Parsed first bytes of an NCI frame. For data packets `gid` holds the
/// connection id and `oid` is meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub mt: u8,
    #[allow(dead_code)]
    pub pbf: u8,
    pub gid: u8,
    pub oid: u8,
    pub len: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum FrameError {
    #[error("frame too short for an NCI header: {0} bytes")]
    Truncated(usize),
    #[error("invalid message type {0:#x}")]
    BadMessageType(u8),
    #[error("declared payload length {declared} but {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },
}

pub(crate) fn parse_header(frame: &[u8]) -> Result<Header, FrameError> {
    if frame.len() < HDR_SIZE {
        return Err(FrameError::Truncated(frame.len()));
    }
    let mt = frame[0] >> MT_SHIFT;
    if mt > MT_NTF {
        return Err(FrameError::BadMessageType(mt));
    }
    let declared = frame[2] as usize;
    let actual = frame.len() - HDR_SIZE;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    Ok(Header {
        mt,
        pbf: (frame[0] & PBF_MASK) >> 4,
        gid: frame[0] & GID_MASK,
        oid: frame[1] & OID_MASK,
        len: frame[2],
    })
}

/// Message type of an already-validated frame.
pub(crate) fn message_type(frame: &[u8]) -> u8 {
    frame.first().map_or(0xFF, |b| b >> MT_SHIFT)
}

/// One outgoing frame under construction. The payload length byte and any
/// interior count byte reserved with [`FrameBuilder::mark`] are patched when
/// the frame is finished, so rules can append fields without bookkeeping.
pub(crate) struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    pub fn control(mt: u8, gid: u8, oid: u8) -> Self {
        let mut buf = BytesMut::with_capacity(MAX_MSG_LEN);
        buf.put_u8((mt << MT_SHIFT) | (gid & GID_MASK));
        buf.put_u8(oid & OID_MASK);
        buf.put_u8(0);
        FrameBuilder { buf }
    }

    pub fn data(conn_id: u8) -> Self {
        let mut buf = BytesMut::with_capacity(MAX_MSG_LEN);
        buf.put_u8(conn_id & GID_MASK);
        buf.put_u8(0);
        buf.put_u8(0);
        FrameBuilder { buf }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16_le(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Reserve one byte and return its position for a later [`Self::patch`].
    pub fn mark(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.put_u8(0);
        at
    }

    /// Store `value` into a byte previously reserved with [`Self::mark`].
    pub fn patch(&mut self, mark: usize, value: u8) {
        self.buf[mark] = value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(mut self) -> BytesMut {
        let payload = self.buf.len() - HDR_SIZE;
        if payload > MAX_PAYLOAD {
            // The pump refuses oversized frames; make the mistake visible.
            error!("built frame exceeds a single NCI packet: {} bytes", payload);
        }
        self.buf[2] = payload.min(MAX_PAYLOAD) as u8;
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_round_trips() {
        for mt in [MT_DATA, MT_CMD, MT_RSP, MT_NTF] {
            for gid in [GID_CORE, GID_RF, GID_NFCEE, GID_PROP] {
                for oid in [0x00u8, 0x17, 0x3F] {
                    let mut b = FrameBuilder::control(mt, gid, oid);
                    b.bytes(&[0xAA, 0xBB]);
                    let frame = b.finish();
                    let hdr = parse_header(&frame).unwrap();
                    assert_eq!(hdr.mt, mt);
                    assert_eq!(hdr.gid, gid);
                    assert_eq!(hdr.oid, oid);
                    assert_eq!(hdr.len, 2);
                    assert_eq!(hdr.pbf, 0);
                }
            }
        }
    }

    #[test]
    fn data_header_carries_conn_id() {
        let mut b = FrameBuilder::data(HCI_CONN_ID);
        b.u8(0x42);
        let frame = b.finish();
        let hdr = parse_header(&frame).unwrap();
        assert_eq!(hdr.mt, MT_DATA);
        assert_eq!(hdr.gid, HCI_CONN_ID);
        assert_eq!(hdr.len, 1);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert_eq!(parse_header(&[0x20, 0x00]), Err(FrameError::Truncated(2)));
    }

    #[test]
    fn bad_message_type_is_rejected() {
        assert_eq!(
            parse_header(&[0x80, 0x00, 0x00]),
            Err(FrameError::BadMessageType(4))
        );
    }

    #[test]
    fn inconsistent_length_is_rejected() {
        assert_eq!(
            parse_header(&[0x20, 0x00, 0x02, 0x01]),
            Err(FrameError::LengthMismatch { declared: 2, actual: 1 })
        );
    }

    #[test]
    fn mark_and_patch_store_interior_counts() {
        let mut b = FrameBuilder::control(MT_RSP, GID_PROP, 0x0C);
        let count_at = b.mark();
        b.u8(0x01).u8(0x02).u8(0x03);
        b.patch(count_at, 3);
        let frame = b.finish();
        assert_eq!(&frame[..], &[0x4F, 0x0C, 0x04, 0x03, 0x01, 0x02, 0x03]);
    }
}
