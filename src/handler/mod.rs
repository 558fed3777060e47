//! Application facade over [`Mac`].
//!
//! [`Handler`] owns the MAC and the device. It turns the request/confirm primitives into a
//! small API (send, join, class changes), saves the persistent context when it changes,
//! chains the steps of a class B switch, answers the network when it asks for an uplink and
//! forwards every event to the application [`HandlerCallbacks`] and to registered
//! [`Package`]s.

pub mod package;

use heapless::Vec;

pub use self::package::{Package, PackageId, PackageRequest, Packages, PACKAGE_MAX};

use crate::device::radio::types::RadioEvent;
use crate::device::timer::{Timer, TimerId};
use crate::device::Device;
use crate::mac::class_b::DEFAULT_PING_SLOT_PERIODICITY;
use crate::mac::nvm::NvmGroups;
use crate::mac::primitives::{
    EventStatus, McpsConfirm, McpsIndication, McpsRequest, MlmeConfirm, MlmeIndication, MlmeRequest, MlmeType,
    Primitives,
};
use crate::mac::region::channel_plan::ChannelPlan;
use crate::mac::region::Region;
use crate::mac::types::{Activation, DeviceClass, DR};
use crate::mac::{self, Mac, Mib, MibAttribute};

/// Outcome of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JoinParams {
    #[allow(missing_docs)]
    pub status: EventStatus,
    #[allow(missing_docs)]
    pub activation: Activation,
    #[allow(missing_docs)]
    pub dev_addr: u32,
    /// Datarate of the next uplink.
    pub data_rate: DR,
}

/// Beacon tracking as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconStatus {
    /// Beacon of the period starting at `time` (GPS seconds) received.
    Received {
        #[allow(missing_docs)]
        time: u32,
    },
    /// Beacon of the period starting at `time` missed.
    NotReceived {
        #[allow(missing_docs)]
        time: u32,
    },
    /// Tracking gave up, the device is back in class A.
    Lost,
}

/// Notifications to the application. Every method defaults to doing nothing.
pub trait HandlerCallbacks {
    /// A join completed, successfully or not.
    fn on_join(&mut self, _params: &JoinParams) {}
    /// A data request completed.
    fn on_tx_data(&mut self, _confirm: &McpsConfirm) {}
    /// Data was received.
    fn on_rx_data(&mut self, _indication: &McpsIndication<'_>) {}
    /// A management request completed.
    fn on_mlme_confirm(&mut self, _confirm: &MlmeConfirm) {}
    #[allow(missing_docs)]
    fn on_class_change(&mut self, _class: DeviceClass) {}
    #[allow(missing_docs)]
    fn on_beacon_status_change(&mut self, _status: BeaconStatus) {}
    /// A DeviceTimeAns updated the time reference.
    fn on_sys_time_update(&mut self) {}
    /// The groups were written to the non-volatile store.
    fn on_nvm_data_change(&mut self, _groups: NvmGroups) {}
}

impl HandlerCallbacks for () {}

/// Requests decided while events were dispatched, run once the MAC is free again.
#[derive(Debug, Default)]
struct FollowUp {
    join: Option<EventStatus>,
    nvm: NvmGroups,
    send_empty: bool,
    device_time: bool,
    beacon_acquisition: bool,
    ping_slot_info: bool,
    class_b: bool,
}

/// Fans MAC primitives out to the application and the packages.
struct Dispatch<'a, 'p, H> {
    callbacks: &'a mut H,
    packages: &'a mut Packages<'p>,
    follow_up: &'a mut FollowUp,
    class: DeviceClass,
    class_b_pending: bool,
}

impl<H: HandlerCallbacks> Dispatch<'_, '_, H> {
    fn compliance_running(&self) -> bool {
        self.packages.is_running(PackageId::Compliance)
    }
}

impl<H: HandlerCallbacks> Primitives for Dispatch<'_, '_, H> {
    fn mcps_confirm(&mut self, confirm: &McpsConfirm) {
        self.callbacks.on_tx_data(confirm);
        for package in self.packages.iter_mut() {
            package.on_mcps_confirm(confirm);
        }
    }

    fn mcps_indication(&mut self, indication: &McpsIndication<'_>) {
        if indication.status != EventStatus::Ok {
            return;
        }
        self.callbacks.on_rx_data(indication);
        for package in self.packages.iter_mut() {
            if indication.port == Some(package.port()) {
                package.on_mcps_indication(indication);
            }
        }
        if indication.frame_pending && self.class == DeviceClass::A {
            self.follow_up.send_empty = true;
        }
    }

    fn mlme_confirm(&mut self, confirm: &MlmeConfirm) {
        self.callbacks.on_mlme_confirm(confirm);
        for package in self.packages.iter_mut() {
            package.on_mlme_confirm(confirm);
        }
        let ok = confirm.status == EventStatus::Ok;
        match confirm.mlme {
            MlmeType::Join => self.follow_up.join = Some(confirm.status),
            MlmeType::DeviceTime => {
                if ok {
                    self.callbacks.on_sys_time_update();
                }
                if self.class_b_pending {
                    self.follow_up.beacon_acquisition = ok;
                    self.follow_up.device_time = !ok;
                }
            }
            MlmeType::BeaconAcquisition if self.class_b_pending => {
                // Without a beacon the time reference is refreshed and the search restarts.
                self.follow_up.ping_slot_info = ok;
                self.follow_up.device_time = !ok;
            }
            MlmeType::PingSlotInfo if self.class_b_pending => {
                self.follow_up.class_b = ok;
                self.follow_up.ping_slot_info = !ok;
            }
            _ => {}
        }
    }

    fn mlme_indication(&mut self, indication: &MlmeIndication) {
        for package in self.packages.iter_mut() {
            package.on_mlme_indication(indication);
        }
        match *indication {
            MlmeIndication::ScheduleUplink => {
                if !self.compliance_running() {
                    self.follow_up.send_empty = true;
                }
            }
            MlmeIndication::Beacon { status, time } => {
                let status = match status {
                    EventStatus::BeaconLocked => BeaconStatus::Received { time },
                    _ => BeaconStatus::NotReceived { time },
                };
                self.callbacks.on_beacon_status_change(status);
            }
            MlmeIndication::BeaconLost => {
                self.callbacks.on_beacon_status_change(BeaconStatus::Lost);
                self.follow_up.device_time = true;
            }
            MlmeIndication::ClassChanged(class) => self.callbacks.on_class_change(class),
        }
    }

    fn nvm_data_change(&mut self, groups: NvmGroups) {
        self.follow_up.nvm |= groups;
    }
}

/// Follow-up requests are best effort, a refusal is only logged.
fn refused<D: Device>(what: &str, err: &crate::Error<D>) {
    match err {
        crate::Error::Mac(err) => debug!("{} refused: {:?}", what, err),
        _ => warn!("{} failed", what),
    }
}

/// The MAC, its device, the application callbacks and the package registry.
pub struct Handler<'p, R, C, D, H>
where
    R: Region,
    C: ChannelPlan<R>,
    D: Device,
    H: HandlerCallbacks,
{
    mac: Mac<R, C>,
    device: D,
    callbacks: H,
    packages: Packages<'p>,
    activation: Activation,
    ping_slot_periodicity: u8,
    class_b_pending: bool,
}

impl<'p, R, C, D, H> Handler<'p, R, C, D, H>
where
    R: Region,
    C: ChannelPlan<R>,
    D: Device,
    H: HandlerCallbacks,
{
    /// Handler joining with `activation`, [`Activation::Otaa`] or [`Activation::Abp`]. ABP
    /// session parameters are written through [`Handler::mib_set`] before [`Handler::join`].
    pub fn new(mac: Mac<R, C>, device: D, callbacks: H, activation: Activation) -> Self {
        Self {
            mac,
            device,
            callbacks,
            packages: Packages::default(),
            activation,
            ping_slot_periodicity: DEFAULT_PING_SLOT_PERIODICITY,
            class_b_pending: false,
        }
    }

    /// Restore the stored context and start the radio. Returns the restored groups.
    pub fn init(&mut self) -> Result<NvmGroups, crate::Error<D>> {
        let restored = self.mac.restore(&mut self.device)?;
        self.mac.start(&mut self.device)?;
        if !restored.is_empty() {
            info!("context restored, joined: {}", self.mac.is_joined());
        }
        Ok(restored)
    }

    #[allow(missing_docs)]
    pub fn mac(&self) -> &Mac<R, C> {
        &self.mac
    }

    #[allow(missing_docs)]
    pub fn device(&mut self) -> &mut D {
        &mut self.device
    }

    #[allow(missing_docs)]
    pub fn callbacks(&mut self) -> &mut H {
        &mut self.callbacks
    }

    /// Add a package to its slot.
    pub fn register(&mut self, package: &'p mut dyn Package) -> Result<(), crate::Error<D>> {
        let id = package.id();
        if !self.packages.register(package) {
            return Err(mac::Error::ParameterInvalid.into());
        }
        debug!("package {:?} registered", id);
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn package_is_running(&self, id: PackageId) -> bool {
        self.packages.is_running(id)
    }

    /// Can no new uplink be sent now? A device without a session starts joining.
    pub fn is_busy(&mut self) -> bool {
        if self.mac.is_busy() {
            return true;
        }
        if !self.mac.is_joined() {
            if let Err(err) = self.join() {
                refused("join", &err);
            }
            return true;
        }
        self.packages.is_running(PackageId::Compliance)
    }

    /// Activation of the current session, `None` before joining.
    pub fn join_status(&self) -> Option<Activation> {
        match self.mac.session().activation {
            Activation::None => None,
            activation => Some(activation),
        }
    }

    /// Start an OTAA join, or activate the ABP session. The outcome is reported through
    /// [`HandlerCallbacks::on_join`].
    pub fn join(&mut self) -> Result<(), crate::Error<D>> {
        match self.activation {
            Activation::Abp => {
                self.mac.mib_set(&mut self.device, Mib::NetworkActivation(Activation::Abp))?;
                self.save_dirty()?;
                let params = self.join_params(EventStatus::Ok);
                self.callbacks.on_join(&params);
                Ok(())
            }
            _ => self.mac.mlme_request(&mut self.device, &MlmeRequest::Join),
        }
    }

    /// Send application data. Without a session a join is started instead and
    /// [`mac::Error::NoNetworkJoined`] returned.
    pub fn send(&mut self, port: u8, payload: &[u8], confirmed: bool) -> Result<(), crate::Error<D>> {
        if !self.mac.is_joined() {
            if let Err(err) = self.join() {
                refused("join", &err);
            }
            return Err(mac::Error::NoNetworkJoined.into());
        }
        if self.packages.is_running(PackageId::Compliance)
            && self.packages.port(PackageId::Compliance) != Some(port)
        {
            return Err(mac::Error::Busy.into());
        }
        let request = if confirmed {
            McpsRequest::Confirmed { port, payload }
        } else {
            McpsRequest::Unconfirmed { port, payload }
        };
        self.mac.mcps_request(&mut self.device, &request)
    }

    /// Empty uplink carrying pending MAC commands.
    fn send_empty(&mut self) -> Result<(), crate::Error<D>> {
        let port = *mac::APP_PORTS.start();
        self.mac.mcps_request(&mut self.device, &McpsRequest::Unconfirmed { port, payload: &[] })
    }

    /// Switch class. Class C is immediate. Class B first refreshes the time, acquires the
    /// beacon and announces the ping slot periodicity, the switch is reported through
    /// [`HandlerCallbacks::on_class_change`] once all three succeeded.
    pub fn request_class(&mut self, class: DeviceClass) -> Result<(), crate::Error<D>> {
        let current = self.mac.class();
        if class == current {
            return Ok(());
        }
        match class {
            DeviceClass::A => {
                self.class_b_pending = false;
                self.set_class(DeviceClass::A)
            }
            _ if current != DeviceClass::A => Err(mac::Error::ParameterInvalid.into()),
            DeviceClass::C => self.set_class(DeviceClass::C),
            DeviceClass::B => {
                self.class_b_pending = true;
                self.device_time_request()
            }
        }
    }

    fn set_class(&mut self, class: DeviceClass) -> Result<(), crate::Error<D>> {
        self.mac.set_class(&mut self.device, class)?;
        self.save_dirty()?;
        self.callbacks.on_class_change(class);
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn current_class(&self) -> DeviceClass {
        self.mac.class()
    }

    #[allow(missing_docs)]
    pub fn current_data_rate(&self) -> DR {
        self.mac.configuration().tx_data_rate()
    }

    /// Queue a DeviceTimeReq for the next uplink.
    pub fn device_time_request(&mut self) -> Result<(), crate::Error<D>> {
        self.mac.mlme_request(&mut self.device, &MlmeRequest::DeviceTime)
    }

    /// Announce the ping slot periodicity and send an empty uplink carrying it.
    pub fn ping_slot_req(&mut self, periodicity: u8) -> Result<(), crate::Error<D>> {
        self.mac.mlme_request(&mut self.device, &MlmeRequest::PingSlotInfo { periodicity })?;
        self.ping_slot_periodicity = periodicity;
        self.send_empty()
    }

    #[allow(missing_docs)]
    pub fn mib_get(&self, attribute: MibAttribute) -> Result<Mib, mac::Error> {
        self.mac.mib_get(attribute)
    }

    /// Write a MAC parameter and save what it changed.
    pub fn mib_set(&mut self, value: Mib) -> Result<(), crate::Error<D>> {
        self.mac.mib_set(&mut self.device, value)?;
        self.save_dirty()
    }

    /// Record a radio completion, callable from interrupt context.
    pub fn on_radio_event(&mut self, event: RadioEvent<'_>) {
        let now = self.device.timer().now();
        self.mac.on_radio_event(event, now);
    }

    /// Record a timer expiry, callable from interrupt context.
    pub fn on_timer_event(&mut self, id: TimerId) {
        self.mac.on_timer_event(id);
    }

    /// Run the MAC, deliver its events, save changed groups and serve follow-up requests
    /// and packages.
    pub fn process(&mut self) -> Result<(), crate::Error<D>> {
        let mut follow_up = FollowUp::default();
        let mut dispatch = Dispatch {
            callbacks: &mut self.callbacks,
            packages: &mut self.packages,
            follow_up: &mut follow_up,
            class: self.mac.class(),
            class_b_pending: self.class_b_pending,
        };
        self.mac.process(&mut self.device, &mut dispatch)?;
        self.save(follow_up.nvm)?;

        if let Some(status) = follow_up.join {
            let params = self.join_params(status);
            self.callbacks.on_join(&params);
        }
        if follow_up.class_b {
            self.class_b_pending = false;
            self.set_class(DeviceClass::B)?;
        }
        if follow_up.device_time {
            self.follow(MlmeRequest::DeviceTime);
        }
        if follow_up.beacon_acquisition {
            self.follow(MlmeRequest::BeaconAcquisition);
        }
        if follow_up.ping_slot_info {
            if let Err(err) = self.ping_slot_req(self.ping_slot_periodicity) {
                refused("ping slot info", &err);
            }
        }
        if follow_up.send_empty && !self.mac.is_busy() {
            if let Err(err) = self.send_empty() {
                refused("empty uplink", &err);
            }
        }
        self.process_packages()
    }

    fn follow(&mut self, request: MlmeRequest) {
        if let Err(err) = self.mac.mlme_request(&mut self.device, &request) {
            debug!("{:?} not started", request.kind());
            refused("mlme request", &err);
        }
    }

    fn process_packages(&mut self) -> Result<(), crate::Error<D>> {
        let mut requests: Vec<PackageRequest, PACKAGE_MAX> = Vec::new();
        for package in self.packages.iter_mut() {
            if let Some(request) = package.process() {
                let _ = requests.push(request);
            }
        }
        for request in requests {
            let result = match request {
                PackageRequest::Send { port, payload, confirmed } => self.send(port, &payload, confirmed),
                PackageRequest::Join => self.join(),
                PackageRequest::DeviceTime => self.device_time_request(),
            };
            if let Err(err) = result {
                refused("package request", &err);
            }
        }
        Ok(())
    }

    fn join_params(&self, status: EventStatus) -> JoinParams {
        JoinParams {
            status,
            activation: self.activation,
            dev_addr: self.mac.session().dev_addr(),
            data_rate: self.mac.configuration().tx_data_rate(),
        }
    }

    fn save_dirty(&mut self) -> Result<(), crate::Error<D>> {
        let groups = self.mac.take_dirty();
        self.save(groups)
    }

    fn save(&mut self, groups: NvmGroups) -> Result<(), crate::Error<D>> {
        if groups.is_empty() {
            return Ok(());
        }
        self.mac.save(&mut self.device, groups)?;
        self.callbacks.on_nvm_data_change(groups);
        Ok(())
    }
}
