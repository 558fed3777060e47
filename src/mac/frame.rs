//! LoRaWAN 1.0.x PHYPayload encoding and decoding.
//!
//! Only layout lives here. Encryption and MIC handling of the bytes produced or consumed by
//! this module belong to [`super::crypto`].

use crate::device::radio_buffer::RadioBuffer;

/// Size of the message integrity code.
pub const MIC_LEN: usize = 4;
/// Largest FOpts field.
pub const MAX_FOPTS_LEN: usize = 15;
/// MHDR + JoinEUI + DevEUI + DevNonce + MIC.
pub const JOIN_REQUEST_LEN: usize = 23;
/// MHDR + DevAddr + FCtrl + FCnt + MIC.
pub const MIN_DATA_FRAME_LEN: usize = 12;
/// FHDR without FOpts.
pub const FHDR_LEN: usize = 7;

const MAJOR_LORAWAN_R1: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    InvalidLength,
    UnsupportedMajor,
    UnexpectedMType,
    BufferFull,
}

impl From<crate::device::radio_buffer::Error> for Error {
    fn from(_: crate::device::radio_buffer::Error) -> Self {
        Error::BufferFull
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    Rfu = 6,
    Proprietary = 7,
}

impl MType {
    /// Message type encoded in an MHDR byte.
    pub fn from_mhdr(mhdr: u8) -> MType {
        match mhdr >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }

    /// MHDR byte for this message type, LoRaWAN R1 major version.
    pub fn mhdr(self) -> u8 {
        ((self as u8) << 5) | MAJOR_LORAWAN_R1
    }
}

/// Frame control octet. Bit 4 is ClassB on uplinks and FPending on downlinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FCtrl(pub u8);

impl FCtrl {
    /// ADR bit.
    pub fn adr(&self) -> bool {
        self.0 & 0x80 != 0
    }
    /// Set the ADR bit.
    pub fn set_adr(&mut self, enable: bool) -> &mut Self {
        self.set_bit(0x80, enable)
    }
    /// ADRACKReq bit, uplink only.
    pub fn adr_ack_req(&self) -> bool {
        self.0 & 0x40 != 0
    }
    /// Set the ADRACKReq bit.
    pub fn set_adr_ack_req(&mut self, enable: bool) -> &mut Self {
        self.set_bit(0x40, enable)
    }
    /// ACK bit.
    pub fn ack(&self) -> bool {
        self.0 & 0x20 != 0
    }
    /// Set the ACK bit.
    pub fn set_ack(&mut self, enable: bool) -> &mut Self {
        self.set_bit(0x20, enable)
    }
    /// FPending bit, downlink only.
    pub fn f_pending(&self) -> bool {
        self.0 & 0x10 != 0
    }
    /// Set the ClassB bit, uplink only.
    pub fn set_class_b(&mut self, enable: bool) -> &mut Self {
        self.set_bit(0x10, enable)
    }
    /// Length of the FOpts field.
    pub fn f_opts_len(&self) -> usize {
        (self.0 & 0x0F) as usize
    }
    /// Set the length of the FOpts field.
    pub fn set_f_opts_len(&mut self, len: u8) -> &mut Self {
        self.0 = (self.0 & 0xF0) | (len & 0x0F);
        self
    }

    fn set_bit(&mut self, mask: u8, enable: bool) -> &mut Self {
        if enable {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
        self
    }
}

/// Write an unsecured join request, MIC excluded.
pub fn write_join_request<const N: usize>(
    buf: &mut RadioBuffer<N>,
    join_eui: &[u8; 8],
    dev_eui: &[u8; 8],
    dev_nonce: u16,
) -> Result<(), Error> {
    buf.clear();
    buf.push(MType::JoinRequest.mhdr())?;
    // EUIs are kept MSB first and sent LSB first.
    for b in join_eui.iter().rev() {
        buf.push(*b)?;
    }
    for b in dev_eui.iter().rev() {
        buf.push(*b)?;
    }
    buf.extend_from_slice(&dev_nonce.to_le_bytes())?;
    Ok(())
}

/// Plaintext content of an uplink data frame.
#[derive(Debug)]
pub struct DataUplink<'a> {
    /// ConfirmedDataUp, UnconfirmedDataUp or Proprietary.
    pub mtype: MType,
    #[allow(missing_docs)]
    pub dev_addr: u32,
    #[allow(missing_docs)]
    pub fctrl: FCtrl,
    /// Low 16 bits are transmitted.
    pub fcnt: u32,
    /// MAC commands piggybacked in FOpts, at most 15 bytes.
    pub fopts: &'a [u8],
    /// `None` for a frame without FRMPayload.
    pub fport: Option<u8>,
    #[allow(missing_docs)]
    pub payload: &'a [u8],
}

impl DataUplink<'_> {
    /// Write the frame without MIC and with the FRMPayload still in clear.
    pub fn write<const N: usize>(&self, buf: &mut RadioBuffer<N>) -> Result<(), Error> {
        if self.fopts.len() > MAX_FOPTS_LEN {
            return Err(Error::InvalidLength);
        }
        buf.clear();
        buf.push(self.mtype.mhdr())?;
        if self.mtype == MType::Proprietary {
            buf.extend_from_slice(self.payload)?;
            return Ok(());
        }
        let mut fctrl = self.fctrl;
        fctrl.set_f_opts_len(self.fopts.len() as u8);
        buf.extend_from_slice(&self.dev_addr.to_le_bytes())?;
        buf.push(fctrl.0)?;
        buf.extend_from_slice(&(self.fcnt as u16).to_le_bytes())?;
        buf.extend_from_slice(self.fopts)?;
        if let Some(fport) = self.fport {
            buf.push(fport)?;
            buf.extend_from_slice(self.payload)?;
        }
        Ok(())
    }
}

/// Decoded join accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct JoinAccept {
    pub join_nonce: u32,
    pub net_id: u32,
    pub dev_addr: u32,
    pub dl_settings: u8,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAccept {
    /// Decode the decrypted fields following the MHDR, MIC excluded.
    pub fn parse(plain: &[u8]) -> Result<JoinAccept, Error> {
        if plain.len() != 12 && plain.len() != 28 {
            return Err(Error::InvalidLength);
        }
        let cf_list = if plain.len() == 28 {
            let mut cf_list = [0; 16];
            cf_list.copy_from_slice(&plain[12..28]);
            Some(cf_list)
        } else {
            None
        };
        Ok(JoinAccept {
            join_nonce: u24_le(&plain[0..3]),
            net_id: u24_le(&plain[3..6]),
            dev_addr: u32::from_le_bytes([plain[6], plain[7], plain[8], plain[9]]),
            dl_settings: plain[10],
            rx_delay: plain[11],
            cf_list,
        })
    }

    /// RX1 datarate offset from DLSettings.
    pub fn rx1_dr_offset(&self) -> u8 {
        (self.dl_settings >> 4) & 0x07
    }

    /// RX2 datarate from DLSettings.
    pub fn rx2_data_rate(&self) -> u8 {
        self.dl_settings & 0x0F
    }

    /// RX1 delay in seconds, 0 meaning 1.
    pub fn rx_delay_s(&self) -> u8 {
        match self.rx_delay & 0x0F {
            0 => 1,
            delay => delay,
        }
    }
}

/// A received data frame, still encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    #[allow(missing_docs)]
    pub mtype: MType,
    #[allow(missing_docs)]
    pub dev_addr: u32,
    #[allow(missing_docs)]
    pub fctrl: FCtrl,
    /// 16 bits transmitted on air.
    pub fcnt: u16,
    #[allow(missing_docs)]
    pub fopts: &'a [u8],
    #[allow(missing_docs)]
    pub fport: Option<u8>,
    /// Encrypted FRMPayload.
    pub payload: &'a [u8],
    /// Everything covered by the MIC.
    pub authenticated: &'a [u8],
    #[allow(missing_docs)]
    pub mic: [u8; MIC_LEN],
}

impl DataFrame<'_> {
    /// Does the server expect an acknowledgement?
    pub fn is_confirmed(&self) -> bool {
        self.mtype == MType::ConfirmedDataDown
    }
}

/// A received PHYPayload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyPayload<'a> {
    /// Encrypted join accept, MHDR included.
    JoinAccept(&'a [u8]),
    /// Data downlink.
    Data(DataFrame<'a>),
    /// Proprietary frame, MHDR excluded.
    Proprietary(&'a [u8]),
}

/// Decode the layout of a downlink.
pub fn parse(buf: &[u8]) -> Result<PhyPayload<'_>, Error> {
    let mhdr = *buf.first().ok_or(Error::InvalidLength)?;
    if mhdr & 0x03 != MAJOR_LORAWAN_R1 {
        return Err(Error::UnsupportedMajor);
    }
    match MType::from_mhdr(mhdr) {
        MType::JoinAccept => {
            if buf.len() == 17 || buf.len() == 33 {
                Ok(PhyPayload::JoinAccept(buf))
            } else {
                Err(Error::InvalidLength)
            }
        }
        mtype @ (MType::UnconfirmedDataDown | MType::ConfirmedDataDown) => {
            parse_data(mtype, buf).map(PhyPayload::Data)
        }
        MType::Proprietary => Ok(PhyPayload::Proprietary(&buf[1..])),
        _ => Err(Error::UnexpectedMType),
    }
}

fn parse_data(mtype: MType, buf: &[u8]) -> Result<DataFrame<'_>, Error> {
    if buf.len() < MIN_DATA_FRAME_LEN {
        return Err(Error::InvalidLength);
    }
    let mic_start = buf.len() - MIC_LEN;
    let fctrl = FCtrl(buf[5]);
    let fopts_end = 1 + FHDR_LEN + fctrl.f_opts_len();
    if fopts_end > mic_start {
        return Err(Error::InvalidLength);
    }
    let (fport, payload) = if fopts_end < mic_start {
        (Some(buf[fopts_end]), &buf[fopts_end + 1..mic_start])
    } else {
        (None, &buf[mic_start..mic_start])
    };
    let mut mic = [0; MIC_LEN];
    mic.copy_from_slice(&buf[mic_start..]);
    Ok(DataFrame {
        mtype,
        dev_addr: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        fctrl,
        fcnt: u16::from_le_bytes([buf[6], buf[7]]),
        fopts: &buf[1 + FHDR_LEN..fopts_end],
        fport,
        payload,
        authenticated: &buf[..mic_start],
        mic,
    })
}

pub(crate) fn u24_le(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
}
