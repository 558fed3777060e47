//! MAC command parsing and the uplink answer queue.

use heapless::Vec;

use super::frame::{u24_le, MAX_FOPTS_LEN};

/// Capacity of the uplink MAC command buffer in bytes.
pub const MAC_COMMAND_BUFFER_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    BufferFull,
}

/// LinkADRReq payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct LinkAdrReq {
    pub data_rate: u8,
    pub tx_power: u8,
    pub channel_mask: u16,
    pub channel_mask_control: u8,
    pub number_of_transmissions: u8,
}

/// Commands sent by the network server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum DownlinkCommand {
    LinkCheckAns { margin: u8, gateway_count: u8 },
    LinkAdrReq(LinkAdrReq),
    DutyCycleReq { max_duty_cycle: u8 },
    RxParamSetupReq { rx1_dr_offset: u8, rx2_data_rate: u8, frequency: u32 },
    DevStatusReq,
    NewChannelReq { index: u8, frequency: u32, min_dr: u8, max_dr: u8 },
    RxTimingSetupReq { delay: u8 },
    TxParamSetupReq { downlink_dwell_time: bool, uplink_dwell_time: bool, max_eirp: u8 },
    DlChannelReq { index: u8, frequency: u32 },
    /// GPS epoch seconds and 1/256 s fraction at the end of the uplink.
    DeviceTimeAns { seconds: u32, fraction: u8 },
    PingSlotInfoAns,
    PingSlotChannelReq { frequency: u32, data_rate: u8 },
    BeaconTimingAns { delay: u16, channel: u8 },
    BeaconFreqReq { frequency: u32 },
}

impl DownlinkCommand {
    fn parse(cid: u8, payload: &[u8]) -> Option<(DownlinkCommand, usize)> {
        let len = match cid {
            0x02 => 2,
            0x03 | 0x05 | 0x0A | 0x11 => 4,
            0x04 | 0x08 | 0x09 => 1,
            0x06 | 0x10 => 0,
            0x07 | 0x0D => 5,
            0x12 | 0x13 => 3,
            _ => return None,
        };
        let p = payload.get(..len)?;
        let freq = |bytes: &[u8]| u24_le(bytes) * 100;
        let cmd = match cid {
            0x02 => DownlinkCommand::LinkCheckAns { margin: p[0], gateway_count: p[1] },
            0x03 => DownlinkCommand::LinkAdrReq(LinkAdrReq {
                data_rate: p[0] >> 4,
                tx_power: p[0] & 0x0F,
                channel_mask: u16::from_le_bytes([p[1], p[2]]),
                channel_mask_control: (p[3] >> 4) & 0x07,
                number_of_transmissions: p[3] & 0x0F,
            }),
            0x04 => DownlinkCommand::DutyCycleReq { max_duty_cycle: p[0] & 0x0F },
            0x05 => DownlinkCommand::RxParamSetupReq {
                rx1_dr_offset: (p[0] >> 4) & 0x07,
                rx2_data_rate: p[0] & 0x0F,
                frequency: freq(&p[1..4]),
            },
            0x06 => DownlinkCommand::DevStatusReq,
            0x07 => DownlinkCommand::NewChannelReq {
                index: p[0],
                frequency: freq(&p[1..4]),
                min_dr: p[4] & 0x0F,
                max_dr: p[4] >> 4,
            },
            0x08 => DownlinkCommand::RxTimingSetupReq { delay: p[0] & 0x0F },
            0x09 => DownlinkCommand::TxParamSetupReq {
                downlink_dwell_time: p[0] & 0x20 != 0,
                uplink_dwell_time: p[0] & 0x10 != 0,
                max_eirp: p[0] & 0x0F,
            },
            0x0A => DownlinkCommand::DlChannelReq { index: p[0], frequency: freq(&p[1..4]) },
            0x0D => DownlinkCommand::DeviceTimeAns {
                seconds: u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
                fraction: p[4],
            },
            0x10 => DownlinkCommand::PingSlotInfoAns,
            0x11 => DownlinkCommand::PingSlotChannelReq {
                frequency: freq(&p[0..3]),
                data_rate: p[3] & 0x0F,
            },
            0x12 => DownlinkCommand::BeaconTimingAns {
                delay: u16::from_le_bytes([p[0], p[1]]),
                channel: p[2],
            },
            _ => DownlinkCommand::BeaconFreqReq { frequency: freq(&p[0..3]) },
        };
        Some((cmd, len))
    }
}

/// Iterator over the commands of an FOpts field or a port 0 payload. Iteration stops at the
/// first unknown or truncated command since the length of what follows cannot be known.
pub struct DownlinkCommands<'a> {
    data: &'a [u8],
    index: usize,
}

/// Parse downlink MAC commands.
pub fn parse_downlink(data: &[u8]) -> DownlinkCommands<'_> {
    DownlinkCommands { data, index: 0 }
}

impl Iterator for DownlinkCommands<'_> {
    type Item = DownlinkCommand;

    fn next(&mut self) -> Option<Self::Item> {
        let cid = *self.data.get(self.index)?;
        match DownlinkCommand::parse(cid, &self.data[self.index + 1..]) {
            Some((cmd, len)) => {
                self.index += 1 + len;
                Some(cmd)
            }
            None => {
                trace!("unknown or truncated mac command {=u8:#X}", cid);
                self.index = self.data.len();
                None
            }
        }
    }
}

/// Commands queued for the next uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum UplinkCommand {
    LinkCheckReq,
    /// Bit 0 channel mask, bit 1 datarate, bit 2 power.
    LinkAdrAns(u8),
    DutyCycleAns,
    /// Bit 0 channel, bit 1 RX2 datarate, bit 2 RX1 datarate offset.
    RxParamSetupAns(u8),
    /// Battery level (0 external, 255 unknown) and SNR margin.
    DevStatusAns { battery: u8, margin: i8 },
    /// Bit 0 frequency, bit 1 datarate range.
    NewChannelAns(u8),
    RxTimingSetupAns,
    TxParamSetupAns,
    /// Bit 0 frequency, bit 1 uplink frequency exists.
    DlChannelAns(u8),
    DeviceTimeReq,
    PingSlotInfoReq { periodicity: u8 },
    /// Bit 0 frequency, bit 1 datarate.
    PingSlotChannelAns(u8),
    BeaconTimingReq,
    /// Bit 0 frequency.
    BeaconFreqAns(u8),
}

impl UplinkCommand {
    /// Command identifier.
    pub fn cid(&self) -> u8 {
        match self {
            UplinkCommand::LinkCheckReq => 0x02,
            UplinkCommand::LinkAdrAns(_) => 0x03,
            UplinkCommand::DutyCycleAns => 0x04,
            UplinkCommand::RxParamSetupAns(_) => 0x05,
            UplinkCommand::DevStatusAns { .. } => 0x06,
            UplinkCommand::NewChannelAns(_) => 0x07,
            UplinkCommand::RxTimingSetupAns => 0x08,
            UplinkCommand::TxParamSetupAns => 0x09,
            UplinkCommand::DlChannelAns(_) => 0x0A,
            UplinkCommand::DeviceTimeReq => 0x0D,
            UplinkCommand::PingSlotInfoReq { .. } => 0x10,
            UplinkCommand::PingSlotChannelAns(_) => 0x11,
            UplinkCommand::BeaconTimingReq => 0x12,
            UplinkCommand::BeaconFreqAns(_) => 0x13,
        }
    }

    /// Encoded length including the CID.
    pub fn len(&self) -> usize {
        match self {
            UplinkCommand::DevStatusAns { .. } => 3,
            UplinkCommand::LinkAdrAns(_)
            | UplinkCommand::RxParamSetupAns(_)
            | UplinkCommand::NewChannelAns(_)
            | UplinkCommand::DlChannelAns(_)
            | UplinkCommand::PingSlotInfoReq { .. }
            | UplinkCommand::PingSlotChannelAns(_)
            | UplinkCommand::BeaconFreqAns(_) => 2,
            _ => 1,
        }
    }

    /// Answers repeated in every uplink until a downlink is received.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            UplinkCommand::RxParamSetupAns(_)
                | UplinkCommand::RxTimingSetupAns
                | UplinkCommand::DlChannelAns(_)
        )
    }

    fn write<const N: usize>(&self, out: &mut Vec<u8, N>) -> Result<(), Error> {
        out.push(self.cid()).map_err(|_| Error::BufferFull)?;
        let payload: &[u8] = match *self {
            UplinkCommand::LinkAdrAns(status)
            | UplinkCommand::RxParamSetupAns(status)
            | UplinkCommand::NewChannelAns(status)
            | UplinkCommand::DlChannelAns(status)
            | UplinkCommand::PingSlotChannelAns(status)
            | UplinkCommand::BeaconFreqAns(status) => &[status],
            UplinkCommand::PingSlotInfoReq { periodicity } => &[periodicity & 0x07],
            UplinkCommand::DevStatusAns { battery, margin } => &[battery, (margin as u8) & 0x3F],
            _ => &[],
        };
        out.extend_from_slice(payload).map_err(|_| Error::BufferFull)
    }
}

/// Uplink MAC commands waiting for transmission.
#[derive(Debug, Clone, Default)]
pub struct MacCommandBuffer {
    cmds: Vec<UplinkCommand, MAC_COMMAND_BUFFER_LEN>,
}

impl MacCommandBuffer {
    /// Queue a command. Fails when the encoded commands would exceed the buffer.
    pub fn push(&mut self, cmd: UplinkCommand) -> Result<(), Error> {
        if self.encoded_len() + cmd.len() > MAC_COMMAND_BUFFER_LEN {
            return Err(Error::BufferFull);
        }
        self.cmds.push(cmd).map_err(|_| Error::BufferFull)
    }

    /// Encoded length of all queued commands.
    pub fn encoded_len(&self) -> usize {
        self.cmds.iter().map(UplinkCommand::len).sum()
    }

    /// Length of the commands that fit into FOpts.
    pub fn fopts_len(&self) -> usize {
        self.fitting(MAX_FOPTS_LEN).1
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Is a command of the same kind queued?
    pub fn contains(&self, cid: u8) -> bool {
        self.cmds.iter().any(|cmd| cmd.cid() == cid)
    }

    /// Are answers queued that must reach the network before it sends again?
    pub fn has_sticky(&self) -> bool {
        self.cmds.iter().any(UplinkCommand::is_sticky)
    }

    fn fitting(&self, limit: usize) -> (usize, usize) {
        let mut len = 0;
        let mut count = 0;
        for cmd in self.cmds.iter() {
            if len + cmd.len() > limit {
                break;
            }
            len += cmd.len();
            count += 1;
        }
        (count, len)
    }

    /// Encode the leading commands that fit into `limit` bytes, returning how many were
    /// written. Pass the count to [`MacCommandBuffer::on_sent`] once the frame is on air.
    pub fn serialize<const N: usize>(&self, limit: usize, out: &mut Vec<u8, N>) -> Result<usize, Error> {
        let (count, _) = self.fitting(limit);
        for cmd in self.cmds.iter().take(count) {
            cmd.write(out)?;
        }
        Ok(count)
    }

    /// Drop the first `count` commands except sticky answers.
    pub fn on_sent(&mut self, count: usize) {
        let mut index = 0;
        self.cmds.retain(|cmd| {
            let keep = index >= count || cmd.is_sticky();
            index += 1;
            keep
        });
    }

    /// A downlink was received, sticky answers have served their purpose.
    pub fn remove_sticky(&mut self) {
        self.cmds.retain(|cmd| !cmd.is_sticky());
    }

    /// Drop everything, used on join.
    pub fn clear(&mut self) {
        self.cmds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_link_adr_block_and_dev_status() {
        let data = [0x03, 0x52, 0x07, 0x00, 0x01, 0x03, 0x30, 0xFF, 0x00, 0x61, 0x06];
        let cmds: std::vec::Vec<_> = parse_downlink(&data).collect();
        assert_eq!(cmds.len(), 3);
        assert_eq!(
            cmds[0],
            DownlinkCommand::LinkAdrReq(LinkAdrReq {
                data_rate: 5,
                tx_power: 2,
                channel_mask: 0x0007,
                channel_mask_control: 0,
                number_of_transmissions: 1,
            })
        );
        let DownlinkCommand::LinkAdrReq(second) = cmds[1] else { panic!() };
        assert_eq!((second.channel_mask, second.channel_mask_control, second.number_of_transmissions), (0x00FF, 6, 1));
        assert_eq!(cmds[2], DownlinkCommand::DevStatusReq);
    }

    #[test]
    fn parse_frequencies() {
        // 868.1 MHz = 8681000 * 100
        let f = 8_681_000u32.to_le_bytes();
        let data = [0x05, 0x12, f[0], f[1], f[2], 0x07, 3, f[0], f[1], f[2], 0x50];
        let cmds: std::vec::Vec<_> = parse_downlink(&data).collect();
        assert_eq!(
            cmds,
            [
                DownlinkCommand::RxParamSetupReq { rx1_dr_offset: 1, rx2_data_rate: 2, frequency: 868_100_000 },
                DownlinkCommand::NewChannelReq { index: 3, frequency: 868_100_000, min_dr: 0, max_dr: 5 },
            ]
        );
    }

    #[test]
    fn unknown_or_truncated_stops_iteration() {
        let cmds: std::vec::Vec<_> = parse_downlink(&[0x06, 0x7F, 0x06]).collect();
        assert_eq!(cmds, [DownlinkCommand::DevStatusReq]);
        let cmds: std::vec::Vec<_> = parse_downlink(&[0x03, 0x52, 0x07]).collect();
        assert!(cmds.is_empty());
    }

    #[test]
    fn sticky_answers_survive_until_downlink() {
        let mut buffer = MacCommandBuffer::default();
        buffer.push(UplinkCommand::LinkAdrAns(0x07)).unwrap();
        buffer.push(UplinkCommand::RxTimingSetupAns).unwrap();
        buffer.push(UplinkCommand::DevStatusAns { battery: 255, margin: -3 }).unwrap();
        let mut out: Vec<u8, 15> = Vec::new();
        let count = buffer.serialize(MAX_FOPTS_LEN, &mut out).unwrap();
        assert_eq!(count, 3);
        assert_eq!(out.as_slice(), &[0x03, 0x07, 0x08, 0x06, 0xFF, 0x3D]);
        buffer.on_sent(count);
        assert_eq!(buffer.encoded_len(), 1);
        assert!(buffer.contains(0x08));
        buffer.remove_sticky();
        assert!(buffer.is_empty());
    }

    #[test]
    fn fopts_takes_leading_commands_only() {
        let mut buffer = MacCommandBuffer::default();
        for _ in 0..8 {
            buffer.push(UplinkCommand::NewChannelAns(0x03)).unwrap();
        }
        assert_eq!(buffer.encoded_len(), 16);
        assert_eq!(buffer.fopts_len(), 14);
        let mut out: Vec<u8, 15> = Vec::new();
        let count = buffer.serialize(MAX_FOPTS_LEN, &mut out).unwrap();
        assert_eq!(count, 7);
        buffer.on_sent(count);
        assert_eq!(buffer.encoded_len(), 2);
    }

    #[test]
    fn buffer_capacity_is_bounded() {
        let mut buffer = MacCommandBuffer::default();
        for _ in 0..MAC_COMMAND_BUFFER_LEN / 2 {
            buffer.push(UplinkCommand::LinkAdrAns(0)).unwrap();
        }
        assert_eq!(buffer.push(UplinkCommand::DutyCycleAns), Err(Error::BufferFull));
    }
}
