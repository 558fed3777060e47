//! Crypto service: key storage, session and multicast key derivation, MIC, payload
//! encryption and frame counter bookkeeping.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac as _};
use serde::{Deserialize, Serialize};

use super::frame::{DataFrame, JoinAccept, MType, FHDR_LEN, MIC_LEN};
use super::types::LORAWAN_VERSION;
use crate::device::radio_buffer::RadioBuffer;

/// Largest accepted jump of the downlink frame counter.
pub const MAX_FCNT_GAP: u32 = 16384;
/// Stored downlink counter value meaning "no downlink received yet".
pub const FCNT_DOWN_INITIAL_VALUE: u32 = u32::MAX;
/// Number of multicast groups.
pub const MAX_MC_GROUPS: usize = 4;

/// Crypto failures. None of them may alter session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// MIC mismatch.
    FailMic,
    /// Frame not addressed to this device or an active multicast group.
    FailAddress,
    /// Join accept with a JoinNonce not greater than the last accepted one.
    FailJoinNonce,
    /// Downlink counter behind the stored one (replay).
    FailFCntSmaller,
    /// Downlink counter equal to the stored one.
    FailFCntDuplicated,
    /// Downlink counter too far ahead of the stored one.
    FailMaxGapFCnt,
    /// Invalid argument, missing data or exhausted counter.
    FailParam,
    /// Key identifier not usable for the operation.
    InvalidKeyId,
    /// Output buffer too small.
    BufSize,
    /// The key store does not hold the requested key.
    SecureElementFunc,
}

impl<D> From<Error> for crate::Error<D>
where
    D: crate::device::Device,
{
    fn from(value: Error) -> Self {
        Self::Crypto(value)
    }
}

/// AES-128 key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AES128(pub [u8; 16]);

/// Frame direction as used in the crypto blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

/// Keys held by the key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum KeyId {
    AppKey,
    NwkKey,
    /// 1.0.x network session key, serving as FNwkSIntKey, SNwkSIntKey and NwkSEncKey.
    NwkSKey,
    AppSKey,
    McRootKey,
    McKEKey,
    McKey(u8),
    McAppSKey(u8),
    McNwkSKey(u8),
}

/// Which downlink counter a frame is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum FCntId {
    Down,
    McDown(u8),
}

/// Secure element content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStore {
    app_key: Option<AES128>,
    nwk_key: Option<AES128>,
    nwk_s_key: Option<AES128>,
    app_s_key: Option<AES128>,
    mc_root_key: Option<AES128>,
    mc_ke_key: Option<AES128>,
    mc_keys: [Option<AES128>; MAX_MC_GROUPS],
    mc_app_s_keys: [Option<AES128>; MAX_MC_GROUPS],
    mc_nwk_s_keys: [Option<AES128>; MAX_MC_GROUPS],
}

impl KeyStore {
    fn slot(&self, id: KeyId) -> Result<&Option<AES128>, Error> {
        Ok(match id {
            KeyId::AppKey => &self.app_key,
            KeyId::NwkKey => &self.nwk_key,
            KeyId::NwkSKey => &self.nwk_s_key,
            KeyId::AppSKey => &self.app_s_key,
            KeyId::McRootKey => &self.mc_root_key,
            KeyId::McKEKey => &self.mc_ke_key,
            KeyId::McKey(n) => self.mc_keys.get(n as usize).ok_or(Error::InvalidKeyId)?,
            KeyId::McAppSKey(n) => self.mc_app_s_keys.get(n as usize).ok_or(Error::InvalidKeyId)?,
            KeyId::McNwkSKey(n) => self.mc_nwk_s_keys.get(n as usize).ok_or(Error::InvalidKeyId)?,
        })
    }

    fn slot_mut(&mut self, id: KeyId) -> Result<&mut Option<AES128>, Error> {
        Ok(match id {
            KeyId::AppKey => &mut self.app_key,
            KeyId::NwkKey => &mut self.nwk_key,
            KeyId::NwkSKey => &mut self.nwk_s_key,
            KeyId::AppSKey => &mut self.app_s_key,
            KeyId::McRootKey => &mut self.mc_root_key,
            KeyId::McKEKey => &mut self.mc_ke_key,
            KeyId::McKey(n) => self.mc_keys.get_mut(n as usize).ok_or(Error::InvalidKeyId)?,
            KeyId::McAppSKey(n) => {
                self.mc_app_s_keys.get_mut(n as usize).ok_or(Error::InvalidKeyId)?
            }
            KeyId::McNwkSKey(n) => {
                self.mc_nwk_s_keys.get_mut(n as usize).ok_or(Error::InvalidKeyId)?
            }
        })
    }

    /// Look up a key.
    pub fn get(&self, id: KeyId) -> Result<&AES128, Error> {
        self.slot(id)?.as_ref().ok_or(Error::SecureElementFunc)
    }

    /// Store a key.
    pub fn set(&mut self, id: KeyId, key: AES128) -> Result<(), Error> {
        *self.slot_mut(id)? = Some(key);
        Ok(())
    }

    /// Is the key present?
    pub fn contains(&self, id: KeyId) -> bool {
        matches!(self.slot(id), Ok(Some(_)))
    }
}

/// Nonces and counters persisted in the crypto NVM group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CryptoNvm {
    pub(crate) lorawan_version: u32,
    pub(crate) dev_nonce: u16,
    pub(crate) last_join_nonce: Option<u32>,
    pub(crate) fcnt_up: u32,
    pub(crate) fcnt_down: u32,
    pub(crate) mc_fcnt_down: [u32; MAX_MC_GROUPS],
}

impl Default for CryptoNvm {
    fn default() -> Self {
        Self {
            lorawan_version: LORAWAN_VERSION,
            dev_nonce: 0,
            last_join_nonce: None,
            fcnt_up: 0,
            fcnt_down: FCNT_DOWN_INITIAL_VALUE,
            mc_fcnt_down: [FCNT_DOWN_INITIAL_VALUE; MAX_MC_GROUPS],
        }
    }
}

/// Software crypto service over an in-memory key store.
#[derive(Debug, Clone, Default)]
pub struct Crypto {
    pub(crate) keys: KeyStore,
    pub(crate) nvm: CryptoNvm,
}

impl Crypto {
    /// Crypto service provisioned with the root key. For LoRaWAN 1.0.x AppKey and NwkKey are
    /// the same key.
    pub fn new(root_key: [u8; 16]) -> Self {
        let root_key = AES128(root_key);
        let keys = KeyStore {
            app_key: Some(root_key),
            nwk_key: Some(root_key),
            mc_root_key: Some(mc_root_key(&root_key)),
            ..KeyStore::default()
        };
        Self { keys, nvm: CryptoNvm::default() }
    }

    /// Store a key. Setting the AppKey re-derives the multicast root key.
    pub fn set_key(&mut self, id: KeyId, key: AES128) -> Result<(), Error> {
        self.keys.set(id, key)?;
        if id == KeyId::AppKey {
            self.keys.set(KeyId::McRootKey, mc_root_key(&key))?;
        }
        Ok(())
    }

    /// Is the key present?
    pub fn has_key(&self, id: KeyId) -> bool {
        self.keys.contains(id)
    }

    /// Next uplink counter value.
    pub fn fcnt_up(&self) -> u32 {
        self.nvm.fcnt_up
    }

    /// Set the next uplink counter value.
    pub fn set_fcnt_up(&mut self, value: u32) {
        self.nvm.fcnt_up = value;
    }

    /// Hand out the next uplink counter value and consume it.
    pub fn next_fcnt_up(&mut self) -> Result<u32, Error> {
        let fcnt = self.nvm.fcnt_up;
        self.nvm.fcnt_up = fcnt.checked_add(1).ok_or(Error::FailParam)?;
        Ok(fcnt)
    }

    /// Last accepted downlink counter, [`FCNT_DOWN_INITIAL_VALUE`] when none.
    pub fn fcnt_down(&self, id: FCntId) -> Result<u32, Error> {
        match id {
            FCntId::Down => Ok(self.nvm.fcnt_down),
            FCntId::McDown(n) => self.nvm.mc_fcnt_down.get(n as usize).copied().ok_or(Error::FailParam),
        }
    }

    /// Store an accepted downlink counter.
    pub fn set_fcnt_down(&mut self, id: FCntId, value: u32) -> Result<(), Error> {
        match id {
            FCntId::Down => self.nvm.fcnt_down = value,
            FCntId::McDown(n) => {
                *self.nvm.mc_fcnt_down.get_mut(n as usize).ok_or(Error::FailParam)? = value
            }
        }
        Ok(())
    }

    /// Reconstruct the 32 bit downlink counter of a frame without committing it.
    pub fn check_fcnt_down(&self, id: FCntId, frame_fcnt: u16) -> Result<u32, Error> {
        full_fcnt_down(self.fcnt_down(id)?, frame_fcnt)
    }

    /// Increment and return the DevNonce of the next join request.
    pub fn next_dev_nonce(&mut self) -> Result<u16, Error> {
        self.nvm.dev_nonce = self.nvm.dev_nonce.checked_add(1).ok_or(Error::FailParam)?;
        Ok(self.nvm.dev_nonce)
    }

    /// DevNonce used by the last join request.
    pub fn dev_nonce(&self) -> u16 {
        self.nvm.dev_nonce
    }

    fn cipher(&self, id: KeyId) -> Result<Aes128, Error> {
        let key = self.keys.get(id)?;
        Ok(Aes128::new(GenericArray::from_slice(&key.0)))
    }

    fn aes_encrypt(&self, id: KeyId, block: &mut [u8; 16]) -> Result<(), Error> {
        self.cipher(id)?.encrypt_block(GenericArray::from_mut_slice(block));
        Ok(())
    }

    fn cmac(&self, id: KeyId, parts: &[&[u8]]) -> Result<[u8; MIC_LEN], Error> {
        let key = self.keys.get(id)?;
        let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(&key.0));
        for part in parts {
            mac.update(part);
        }
        let tag = mac.finalize().into_bytes();
        let mut mic = [0; MIC_LEN];
        mic.copy_from_slice(&tag[..MIC_LEN]);
        Ok(mic)
    }

    /// Append the MIC of a join request written by [`super::frame::write_join_request`].
    pub fn secure_join_request<const N: usize>(&self, buf: &mut RadioBuffer<N>) -> Result<(), Error> {
        let mic = self.cmac(KeyId::NwkKey, &[buf.as_ref()])?;
        buf.extend_from_slice(&mic).map_err(|_| Error::BufSize)
    }

    /// Decrypt and authenticate a join accept, then derive the session keys and reset the
    /// frame counters. `frame` includes MHDR and MIC.
    pub fn handle_join_accept(&mut self, frame: &[u8], dev_nonce: u16) -> Result<JoinAccept, Error> {
        if frame.len() != 17 && frame.len() != 33 {
            return Err(Error::BufSize);
        }
        let mut plain = [0u8; 32];
        let plain = &mut plain[..frame.len() - 1];
        plain.copy_from_slice(&frame[1..]);
        let cipher = self.cipher(KeyId::NwkKey)?;
        // The network encrypts with AES decrypt, the device decrypts with AES encrypt.
        for block in plain.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        let (fields, mic) = plain.split_at(plain.len() - MIC_LEN);
        if self.cmac(KeyId::NwkKey, &[&frame[..1], fields])? != mic {
            return Err(Error::FailMic);
        }
        let accept = JoinAccept::parse(fields).map_err(|_| Error::FailParam)?;
        if let Some(last) = self.nvm.last_join_nonce {
            if accept.join_nonce <= last {
                return Err(Error::FailJoinNonce);
            }
        }
        self.derive_session_keys(accept.join_nonce, accept.net_id, dev_nonce)?;
        self.nvm.last_join_nonce = Some(accept.join_nonce);
        self.reset_frame_counters();
        Ok(accept)
    }

    /// Derive NwkSKey and AppSKey from the root key.
    pub fn derive_session_keys(&mut self, join_nonce: u32, net_id: u32, dev_nonce: u16) -> Result<(), Error> {
        for (kind, id) in [(0x01, KeyId::NwkSKey), (0x02, KeyId::AppSKey)] {
            let mut block = [0u8; 16];
            block[0] = kind;
            block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
            block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
            block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
            self.aes_encrypt(KeyId::NwkKey, &mut block)?;
            self.keys.set(id, AES128(block))?;
        }
        Ok(())
    }

    /// Reset uplink and downlink counters of the unicast session.
    pub fn reset_frame_counters(&mut self) {
        self.nvm.fcnt_up = 0;
        self.nvm.fcnt_down = FCNT_DOWN_INITIAL_VALUE;
    }

    /// MIC of a data frame.
    pub fn compute_mic(
        &self,
        key: KeyId,
        msg: &[u8],
        dir: Direction,
        dev_addr: u32,
        fcnt: u32,
    ) -> Result<[u8; MIC_LEN], Error> {
        if msg.len() > u8::MAX as usize {
            return Err(Error::BufSize);
        }
        let mut b0 = [0u8; 16];
        b0[0] = 0x49;
        b0[5] = dir as u8;
        b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
        b0[15] = msg.len() as u8;
        self.cmac(key, &[&b0, msg])
    }

    /// Check the MIC of a data frame.
    pub fn verify_mic(
        &self,
        key: KeyId,
        msg: &[u8],
        dir: Direction,
        dev_addr: u32,
        fcnt: u32,
        mic: &[u8; MIC_LEN],
    ) -> Result<(), Error> {
        if &self.compute_mic(key, msg, dir, dev_addr, fcnt)? == mic {
            Ok(())
        } else {
            Err(Error::FailMic)
        }
    }

    /// Encrypt or decrypt FRMPayload in place. The operation is its own inverse.
    pub fn payload_encrypt(
        &self,
        key: KeyId,
        dir: Direction,
        dev_addr: u32,
        fcnt: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let cipher = self.cipher(key)?;
        for (i, chunk) in buf.chunks_mut(16).enumerate() {
            let mut a = [0u8; 16];
            a[0] = 0x01;
            a[5] = dir as u8;
            a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
            a[10..14].copy_from_slice(&fcnt.to_le_bytes());
            a[15] = (i + 1) as u8;
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut a));
            for (b, s) in chunk.iter_mut().zip(a.iter()) {
                *b ^= s;
            }
        }
        Ok(())
    }

    /// Encrypt the FRMPayload of an uplink written by [`super::frame::DataUplink::write`] and
    /// append its MIC.
    pub fn secure_uplink<const N: usize>(
        &self,
        buf: &mut RadioBuffer<N>,
        dev_addr: u32,
        fcnt: u32,
    ) -> Result<(), Error> {
        let raw = buf.as_mut();
        if raw.is_empty() || MType::from_mhdr(raw[0]) == MType::Proprietary {
            return Ok(());
        }
        let port_index = 1 + FHDR_LEN + (raw.get(5).ok_or(Error::BufSize)? & 0x0F) as usize;
        if raw.len() > port_index + 1 {
            let key = session_key_for_port(raw[port_index]);
            self.payload_encrypt(key, Direction::Up, dev_addr, fcnt, &mut raw[port_index + 1..])?;
        }
        let mic = self.compute_mic(KeyId::NwkSKey, buf.as_ref(), Direction::Up, dev_addr, fcnt)?;
        buf.extend_from_slice(&mic).map_err(|_| Error::BufSize)
    }

    /// Authenticate a unicast or multicast downlink against the keys of `address` and
    /// decrypt its FRMPayload into `out`, returning the 32 bit counter that must be committed
    /// with [`Crypto::set_fcnt_down`] once the frame is accepted.
    pub fn unsecure_downlink(
        &self,
        frame: &DataFrame<'_>,
        address: AddressId,
        out: &mut [u8],
    ) -> Result<(u32, usize), Error> {
        let (fcnt_id, nwk_key, app_key) = match address {
            AddressId::Unicast => (FCntId::Down, KeyId::NwkSKey, KeyId::AppSKey),
            AddressId::Multicast(n) => (FCntId::McDown(n), KeyId::McNwkSKey(n), KeyId::McAppSKey(n)),
        };
        let fcnt = self.check_fcnt_down(fcnt_id, frame.fcnt)?;
        self.verify_mic(nwk_key, frame.authenticated, Direction::Down, frame.dev_addr, fcnt, &frame.mic)?;
        let len = frame.payload.len();
        let out = out.get_mut(..len).ok_or(Error::BufSize)?;
        out.copy_from_slice(frame.payload);
        if let Some(port) = frame.fport {
            let key = if port == 0 { nwk_key } else { app_key };
            self.payload_encrypt(key, Direction::Down, frame.dev_addr, fcnt, out)?;
        }
        Ok((fcnt, len))
    }

    /// Derive McKEKey from McRootKey.
    pub fn derive_mc_ke_key(&mut self) -> Result<(), Error> {
        let mut block = [0u8; 16];
        self.aes_encrypt(KeyId::McRootKey, &mut block)?;
        self.keys.set(KeyId::McKEKey, AES128(block))
    }

    /// Store a multicast group key delivered encrypted with McKEKey.
    pub fn set_encrypted_mc_key(&mut self, group: u8, encrypted: [u8; 16]) -> Result<(), Error> {
        let mut block = encrypted;
        self.cipher(KeyId::McKEKey)?.decrypt_block(GenericArray::from_mut_slice(&mut block));
        self.keys.set(KeyId::McKey(group), AES128(block))
    }

    /// Derive McAppSKey and McNwkSKey of a group from its McKey and address.
    pub fn derive_mc_session_key_pair(&mut self, group: u8, mc_addr: u32) -> Result<(), Error> {
        for (kind, id) in [(0x01, KeyId::McAppSKey(group)), (0x02, KeyId::McNwkSKey(group))] {
            let mut block = [0u8; 16];
            block[0] = kind;
            block[1..5].copy_from_slice(&mc_addr.to_le_bytes());
            self.aes_encrypt(KeyId::McKey(group), &mut block)?;
            self.keys.set(id, AES128(block))?;
        }
        Ok(())
    }

    /// AES of a single block with a raw key, used by class B ping slot randomization.
    pub fn aes128(key: &[u8; 16], block: &mut [u8; 16]) {
        Aes128::new(GenericArray::from_slice(key)).encrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Address a downlink was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum AddressId {
    Unicast,
    Multicast(u8),
}

fn session_key_for_port(port: u8) -> KeyId {
    if port == 0 {
        KeyId::NwkSKey
    } else {
        KeyId::AppSKey
    }
}

/// Rebuild the 32 bit counter of a frame from the last accepted value.
fn full_fcnt_down(last: u32, frame_fcnt: u16) -> Result<u32, Error> {
    if last == FCNT_DOWN_INITIAL_VALUE {
        return Ok(frame_fcnt as u32);
    }
    let forward = frame_fcnt.wrapping_sub(last as u16) as u32;
    if forward == 0 {
        return Err(Error::FailFCntDuplicated);
    }
    if forward >= MAX_FCNT_GAP {
        return if 0x1_0000 - forward < MAX_FCNT_GAP {
            Err(Error::FailFCntSmaller)
        } else {
            Err(Error::FailMaxGapFCnt)
        };
    }
    last.checked_add(forward).ok_or(Error::FailMaxGapFCnt)
}

/// McRootKey of LoRaWAN 1.0.x: aes128_encrypt(AppKey, 0x00 | pad16).
fn mc_root_key(app_key: &AES128) -> AES128 {
    let mut block = [0u8; 16];
    Aes128::new(GenericArray::from_slice(&app_key.0)).encrypt_block(GenericArray::from_mut_slice(&mut block));
    AES128(block)
}
