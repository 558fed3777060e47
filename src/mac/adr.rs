//! Device side of adaptive datarate: the ADR_ACK_CNT back-off and the datarate ladder of
//! unacknowledged confirmed uplinks.

use super::types::DR;

/// Transmissions of a confirmed uplink before it is reported unacknowledged.
pub const MAX_ACK_RETRIES: u8 = 8;

/// Link parameters before an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdrParams {
    #[allow(missing_docs)]
    pub adr_enabled: bool,
    /// Uplinks since the last downlink.
    pub ack_counter: u16,
    /// ADR_ACK_LIMIT.
    pub ack_limit: u16,
    /// ADR_ACK_DELAY.
    pub ack_delay: u16,
    #[allow(missing_docs)]
    pub data_rate: DR,
    /// TXPower index, 0 is the maximum power.
    pub tx_power: u8,
    /// Lowest datarate usable by the device in the region.
    pub min_data_rate: DR,
}

/// Link parameters to use for the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdrNext {
    /// Set ADRACKReq in FCtrl.
    pub adr_ack_req: bool,
    #[allow(missing_docs)]
    pub data_rate: DR,
    #[allow(missing_docs)]
    pub tx_power: u8,
    /// The back-off reached the bottom, re-enable the default channels and set NbTrans to 1.
    pub restore_default_channels: bool,
}

/// Link parameters of the next uplink when the network has been silent for
/// `ack_counter` uplinks. From ADR_ACK_LIMIT on the uplink asks for an answer, and every
/// ADR_ACK_DELAY uplinks after that one step of back-off is taken: full power first, then
/// one datarate lower, and at the lowest datarate the default channels come back.
pub fn next(params: &AdrParams) -> AdrNext {
    let mut next = AdrNext {
        adr_ack_req: false,
        data_rate: params.data_rate,
        tx_power: params.tx_power,
        restore_default_channels: false,
    };
    if !params.adr_enabled || params.ack_counter < params.ack_limit {
        return next;
    }
    next.adr_ack_req = true;
    let delay = params.ack_delay.max(1);
    let over = params.ack_counter - params.ack_limit;
    if over < delay || (over - delay) % delay != 0 {
        return next;
    }
    if params.tx_power > 0 {
        next.tx_power = 0;
    } else if params.data_rate > params.min_data_rate {
        next.data_rate = params.data_rate.lowered(1, params.min_data_rate);
    } else {
        next.restore_default_channels = true;
    }
    debug!(
        "adr back-off at {}: dr {:?} power {}",
        params.ack_counter,
        next.data_rate,
        next.tx_power
    );
    next
}

/// Link parameters after `failures` unacknowledged transmissions of a confirmed uplink. The
/// first two failures keep the parameters, each further pair lowers the datarate by one
/// step and, once the datarate is at its minimum, raises the power by one step.
pub fn retry_step(failures: u8, data_rate: DR, tx_power: u8, min_data_rate: DR) -> (DR, u8) {
    if failures < 3 || failures % 2 == 0 {
        return (data_rate, tx_power);
    }
    if data_rate > min_data_rate {
        (data_rate.lowered(1, min_data_rate), tx_power)
    } else {
        (data_rate, tx_power.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ack_counter: u16, data_rate: DR, tx_power: u8) -> AdrParams {
        AdrParams {
            adr_enabled: true,
            ack_counter,
            ack_limit: 64,
            ack_delay: 32,
            data_rate,
            tx_power,
            min_data_rate: DR::_0,
        }
    }

    #[test]
    fn ack_req_from_limit() {
        assert!(!next(&params(63, DR::_5, 2)).adr_ack_req);
        let at_limit = next(&params(64, DR::_5, 2));
        assert!(at_limit.adr_ack_req);
        assert_eq!((at_limit.data_rate, at_limit.tx_power), (DR::_5, 2));
        let disabled = AdrParams { adr_enabled: false, ..params(200, DR::_5, 2) };
        assert!(!next(&disabled).adr_ack_req);
    }

    #[test]
    fn backoff_raises_power_then_lowers_datarate() {
        let step = next(&params(95, DR::_5, 2));
        assert_eq!((step.data_rate, step.tx_power), (DR::_5, 2));
        let step = next(&params(96, DR::_5, 2));
        assert_eq!((step.data_rate, step.tx_power), (DR::_5, 0));
        let step = next(&params(97, DR::_5, 0));
        assert_eq!(step.data_rate, DR::_5);
        let step = next(&params(128, DR::_5, 0));
        assert_eq!(step.data_rate, DR::_4);
        let step = next(&params(160, DR::_0, 0));
        assert_eq!(step.data_rate, DR::_0);
        assert!(step.restore_default_channels);
    }

    #[test]
    fn confirmed_retry_ladder() {
        let mut dr = DR::_2;
        let mut power = 3;
        let mut seen = std::vec::Vec::new();
        for failures in 1..=10 {
            (dr, power) = retry_step(failures, dr, power, DR::_0);
            seen.push((dr, power));
        }
        assert_eq!(
            seen,
            [
                (DR::_2, 3),
                (DR::_2, 3),
                (DR::_1, 3),
                (DR::_1, 3),
                (DR::_0, 3),
                (DR::_0, 3),
                (DR::_0, 2),
                (DR::_0, 2),
                (DR::_0, 1),
                (DR::_0, 1),
            ]
        );
    }

    #[test]
    fn ladder_respects_region_minimum() {
        assert_eq!(retry_step(3, DR::_8, 0, DR::_8), (DR::_8, 0));
        assert_eq!(retry_step(5, DR::_4, 1, DR::_3), (DR::_3, 1));
    }
}
