//! macOS Bluetooth over IOBluetooth channel objects.
//!
//! A Bluetooth endpoint here is not a file descriptor, so it cannot be
//! waited on by kqueue. Channel I/O completes through IOBluetooth delegate
//! callbacks delivered on the main run loop; each callback fills in the
//! pending completion cell and the task waker routes resumption back onto
//! the owning thread, exactly like a kqueue or ring completion would.
//!
//! The embedding application must keep the main run loop serviced (the
//! graphical shell does this as part of its frame loop).

#![allow(non_snake_case)]

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, OnceLock};

use objc2::rc::Retained;
use objc2::runtime::{AnyClass, AnyObject, ClassBuilder, Sel};
use objc2::{msg_send, sel};
use objc2_foundation::{NSArray, NSString};

use crate::btutils::{ProfileDesc, SdpResult};
use crate::device::{ConnectionType, Device};
use crate::error::{Error, ErrorKind, Result, SystemError};
use crate::runtime::op::{Completion, CompletionResult, OpRef, Payload};
use crate::uuid::{uuid_from_base, Uuid128, L2CAP_PROTO_UUID, RFCOMM_PROTO_UUID};

type IOReturn = i32;

const KIO_RETURN_SUCCESS: IOReturn = 0;

fn io_error(code: IOReturn) -> Error {
    SystemError::new(code, ErrorKind::IoReturn).into()
}

/// Shared per-channel state fed by delegate callbacks.
struct ChannelShared {
    /// FIFO of completions for writes and opens, matched in order.
    pending: Mutex<VecDeque<OpRef>>,
    /// Bytes the peer sent that nobody has read yet.
    received: Mutex<VecDeque<u8>>,
    /// Completion of an outstanding read, resumed on data or closure.
    reader: Mutex<Option<OpRef>>,
    /// Incoming channels on a listening endpoint.
    incoming: Mutex<VecDeque<(Channel, Device)>>,
    /// Completion of an outstanding accept.
    acceptor: Mutex<Option<OpRef>>,
    closed: Mutex<bool>,
}

impl ChannelShared {
    fn new() -> Arc<ChannelShared> {
        Arc::new(ChannelShared {
            pending: Mutex::new(VecDeque::new()),
            received: Mutex::new(VecDeque::new()),
            reader: Mutex::new(None),
            incoming: Mutex::new(VecDeque::new()),
            acceptor: Mutex::new(None),
            closed: Mutex::new(false),
        })
    }

    fn push_pending(&self, completion: OpRef) {
        self.pending.lock().unwrap().push_back(completion);
    }

    fn complete_one(&self, status: IOReturn) {
        if let Some(completion) = self.pending.lock().unwrap().pop_front() {
            if status == KIO_RETURN_SUCCESS {
                completion.complete(CompletionResult::ok(0, Payload::None));
            } else {
                completion.complete(CompletionResult {
                    res: 0,
                    error: status,
                    payload: Payload::None,
                });
            }
        }
    }

    fn deliver_data(&self, data: &[u8]) {
        self.received.lock().unwrap().extend(data.iter().copied());
        self.wake_reader();
    }

    fn mark_closed(&self) {
        *self.closed.lock().unwrap() = true;
        self.wake_reader();
    }

    fn wake_reader(&self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            let mut received = self.received.lock().unwrap();
            let data: Vec<u8> = received.drain(..).collect();
            reader.complete(CompletionResult::ok(data.len() as i32, Payload::Buffer(data)));
        }
    }

    /// Aborts every queued operation with `kIOReturnAborted`.
    fn abort_all(&self) {
        let aborted = crate::sys::KIO_RETURN_ABORTED;
        for completion in self.pending.lock().unwrap().drain(..) {
            completion.complete(CompletionResult::err(aborted));
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.complete(CompletionResult::err(aborted));
        }
        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            acceptor.complete(CompletionResult::err(aborted));
        }
    }
}

/// An open (or listening) IOBluetooth RFCOMM or L2CAP channel.
///
/// Clones share the underlying channel object and its callback state; the
/// channel is identified in logs by its object hash, mirroring how the
/// pending-operations table keys macOS Bluetooth work.
#[derive(Clone)]
pub(crate) struct Channel {
    object: Retained<AnyObject>,
    shared: Arc<ChannelShared>,
    conn_type: ConnectionType,
}

// IOBluetooth objects are documented main-thread-affine for delegate
// delivery but safe to message from other threads.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hash: usize = unsafe { msg_send![&*self.object, hash] };
        f.debug_struct("Channel")
            .field("hash", &hash)
            .field("protocol", &self.conn_type)
            .finish()
    }
}

impl Channel {
    /// Opens a channel to a remote device and waits for the open-complete
    /// callback.
    pub(crate) async fn open(
        address: &str,
        port: u16,
        conn_type: ConnectionType,
    ) -> Result<Channel> {
        let shared = ChannelShared::new();
        let delegate = make_delegate(shared.clone());

        let ns_addr = NSString::from_str(address);
        let device: Option<Retained<AnyObject>> = unsafe {
            let class = AnyClass::get(c"IOBluetoothDevice").expect("IOBluetooth not loaded");
            msg_send![class, deviceWithAddressString: &*ns_addr]
        };
        let device = device.ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;

        let completion = Completion::new();
        shared.push_pending(completion.clone());

        let mut object: *mut AnyObject = std::ptr::null_mut();
        let status: IOReturn = unsafe {
            match conn_type {
                ConnectionType::Rfcomm => msg_send![
                    &*device,
                    openRFCOMMChannelAsync: &mut object,
                    withChannelID: port as u8,
                    delegate: &*delegate
                ],
                ConnectionType::L2cap => msg_send![
                    &*device,
                    openL2CAPChannelAsync: &mut object,
                    withPSM: port,
                    delegate: &*delegate
                ],
                _ => unreachable!("Bluetooth connect with a non-Bluetooth device"),
            }
        };
        if status != KIO_RETURN_SUCCESS {
            return Err(io_error(status));
        }

        let object = unsafe { Retained::retain(object) }
            .ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;

        // Wait for the open-complete callback.
        wait(completion).await?;
        std::mem::forget(delegate);
        Ok(Channel {
            object,
            shared,
            conn_type,
        })
    }

    /// Publishes a listening endpoint and registers for channel-open
    /// notifications. Returns the advertised channel/PSM.
    pub(crate) fn listen(device: &Device) -> Result<(Channel, u16)> {
        let shared = ChannelShared::new();
        let delegate = make_delegate(shared.clone());

        let (notification, port): (Option<Retained<AnyObject>>, u16) = unsafe {
            match device.conn_type {
                ConnectionType::Rfcomm => {
                    let class = AnyClass::get(c"IOBluetoothRFCOMMChannel").unwrap();
                    let channel_id: u8 = device.port as u8;
                    let n = msg_send![
                        class,
                        registerForChannelOpenNotifications: &*delegate,
                        selector: sel!(newChannelOpened:channel:),
                        withChannelID: channel_id,
                        direction: 1u32 // kIOBluetoothUserNotificationChannelDirectionIncoming
                    ];
                    (n, u16::from(channel_id))
                }
                ConnectionType::L2cap => {
                    let class = AnyClass::get(c"IOBluetoothL2CAPChannel").unwrap();
                    let n = msg_send![
                        class,
                        registerForChannelOpenNotifications: &*delegate,
                        selector: sel!(newChannelOpened:channel:),
                        withPSM: device.port,
                        direction: 1u32
                    ];
                    (n, device.port)
                }
                _ => unreachable!("Bluetooth server with a non-Bluetooth device"),
            }
        };
        let notification = notification.ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;
        std::mem::forget(delegate);

        Ok((
            Channel {
                object: notification,
                shared,
                conn_type: device.conn_type,
            },
            port,
        ))
    }

    /// Waits for an incoming channel on a listening endpoint.
    pub(crate) async fn accept(&self, conn_type: ConnectionType) -> Result<(Channel, Device)> {
        loop {
            if let Some((channel, device)) = self.shared.incoming.lock().unwrap().pop_front() {
                let mut device = device;
                device.conn_type = conn_type;
                return Ok((channel, device));
            }

            let completion = Completion::new();
            *self.shared.acceptor.lock().unwrap() = Some(completion.clone());
            wait(completion).await?;
        }
    }

    /// Writes asynchronously; completes on the write-complete callback.
    pub(crate) async fn send(&self, data: Vec<u8>) -> Result<()> {
        let completion = Completion::new();
        self.shared.push_pending(completion.clone());

        let status: IOReturn = unsafe {
            msg_send![
                &*self.object,
                writeAsync: data.as_ptr() as *mut c_void,
                length: data.len() as u16,
                refcon: std::ptr::null_mut::<c_void>()
            ]
        };
        if status != KIO_RETURN_SUCCESS {
            self.shared.complete_one(status);
        }
        wait(completion).await?;
        Ok(())
    }

    /// Returns buffered data, or waits for the next data callback. An
    /// empty result means the channel closed.
    pub(crate) async fn recv(&self, size: usize) -> Result<Vec<u8>> {
        {
            let mut received = self.shared.received.lock().unwrap();
            if !received.is_empty() {
                let take = received.len().min(size);
                return Ok(received.drain(..take).collect());
            }
            if *self.shared.closed.lock().unwrap() {
                return Ok(Vec::new());
            }
        }

        let completion = Completion::new();
        *self.shared.reader.lock().unwrap() = Some(completion.clone());
        let result = wait(completion).await?;
        match result.payload {
            Payload::Buffer(data) => Ok(data),
            _ => Ok(Vec::new()),
        }
    }

    /// Closes the channel.
    pub(crate) fn close(&self) {
        unsafe {
            let _: IOReturn = msg_send![&*self.object, closeChannel];
        }
        self.shared.mark_closed();
    }

    /// Aborts all of this channel's queued operations.
    pub(crate) fn abort_pending(&self) {
        self.shared.abort_all();
    }
}

async fn wait(completion: OpRef) -> Result<CompletionResult> {
    let home = crate::runtime::current_ordinal();
    // No operation to submit: the delegate callback completes the cell.
    let result = crate::runtime::op::Submit::new_noop(completion, home).await;
    if crate::error::is_fatal(result.error) {
        return Err(SystemError::new(result.error, ErrorKind::IoReturn).into());
    }
    Ok(result)
}

/// Builds the Objective-C delegate object that forwards IOBluetooth
/// callbacks into a [`ChannelShared`].
fn make_delegate(shared: Arc<ChannelShared>) -> Retained<AnyObject> {
    static CLASS: OnceLock<&'static AnyClass> = OnceLock::new();

    let class = CLASS.get_or_init(|| unsafe {
        let superclass = AnyClass::get(c"NSObject").unwrap();
        let mut builder = ClassBuilder::new(c"NettermChannelDelegate", superclass)
            .expect("delegate class already registered");

        builder.add_ivar::<*mut c_void>(c"shared");

        unsafe extern "C" fn open_complete(
            this: *mut AnyObject,
            _sel: Sel,
            _channel: *mut AnyObject,
            status: IOReturn,
        ) {
            with_shared(this, |shared| shared.complete_one(status));
        }

        unsafe extern "C" fn write_complete(
            this: *mut AnyObject,
            _sel: Sel,
            _channel: *mut AnyObject,
            _refcon: *mut c_void,
            status: IOReturn,
        ) {
            with_shared(this, |shared| shared.complete_one(status));
        }

        unsafe extern "C" fn data_received(
            this: *mut AnyObject,
            _sel: Sel,
            _channel: *mut AnyObject,
            data: *mut c_void,
            length: usize,
        ) {
            let bytes = std::slice::from_raw_parts(data as *const u8, length);
            with_shared(this, |shared| shared.deliver_data(bytes));
        }

        unsafe extern "C" fn channel_closed(
            this: *mut AnyObject,
            _sel: Sel,
            _channel: *mut AnyObject,
        ) {
            with_shared(this, |shared| shared.mark_closed());
        }

        builder.add_method(
            sel!(rfcommChannelOpenComplete:status:),
            open_complete as unsafe extern "C" fn(_, _, _, _),
        );
        builder.add_method(
            sel!(l2capChannelOpenComplete:status:),
            open_complete as unsafe extern "C" fn(_, _, _, _),
        );
        builder.add_method(
            sel!(rfcommChannelWriteComplete:refcon:status:),
            write_complete as unsafe extern "C" fn(_, _, _, _, _),
        );
        builder.add_method(
            sel!(l2capChannelWriteComplete:refcon:status:),
            write_complete as unsafe extern "C" fn(_, _, _, _, _),
        );
        builder.add_method(
            sel!(rfcommChannelData:data:length:),
            data_received as unsafe extern "C" fn(_, _, _, _, _),
        );
        builder.add_method(
            sel!(l2capChannelData:data:length:),
            data_received as unsafe extern "C" fn(_, _, _, _, _),
        );
        builder.add_method(
            sel!(rfcommChannelClosed:),
            channel_closed as unsafe extern "C" fn(_, _, _),
        );
        builder.add_method(
            sel!(l2capChannelClosed:),
            channel_closed as unsafe extern "C" fn(_, _, _),
        );

        builder.register()
    });

    unsafe {
        let delegate: Retained<AnyObject> = msg_send![*class, new];
        let ivar = (*class).instance_variable(c"shared").unwrap();
        let slot = ivar.load_ptr::<*mut c_void>(&*delegate);
        *slot = Arc::into_raw(shared) as *mut c_void;
        delegate
    }
}

unsafe fn with_shared(this: *mut AnyObject, f: impl FnOnce(&ChannelShared)) {
    let class = (*this).class();
    let ivar = class.instance_variable(c"shared").unwrap();
    let ptr = *ivar.load::<*mut c_void>(&*this) as *const ChannelShared;
    if !ptr.is_null() {
        f(&*ptr);
    }
}

/// Enumerates devices paired with this computer.
pub(crate) fn get_paired() -> Result<Vec<Device>> {
    unsafe {
        let class = AnyClass::get(c"IOBluetoothDevice")
            .ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;
        let paired: Option<Retained<NSArray<AnyObject>>> = msg_send![class, pairedDevices];
        let Some(paired) = paired else {
            return Ok(Vec::new());
        };

        let mut devices = Vec::new();
        for device in paired.iter() {
            let name: Option<Retained<NSString>> = msg_send![&*device, name];
            let address: Option<Retained<NSString>> = msg_send![&*device, addressString];
            let Some(address) = address else { continue };

            devices.push(Device {
                conn_type: ConnectionType::None,
                name: name.map(|n| n.to_string()).unwrap_or_default(),
                // IOBluetooth formats with dashes; normalize to colons.
                address: address.to_string().replace('-', ":").to_uppercase(),
                port: 0,
            });
        }
        Ok(devices)
    }
}

/// Runs an SDP query against a remote device and walks its service
/// records.
pub(crate) fn sdp_lookup(address: &str, uuid: Uuid128, _flush_cache: bool) -> Result<Vec<SdpResult>> {
    unsafe {
        let class = AnyClass::get(c"IOBluetoothDevice")
            .ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;
        let ns_addr = NSString::from_str(address);
        let device: Option<Retained<AnyObject>> =
            msg_send![class, deviceWithAddressString: &*ns_addr];
        let device = device.ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;

        let uuid_class = AnyClass::get(c"IOBluetoothSDPUUID").unwrap();
        let target: Option<Retained<AnyObject>> = msg_send![
            uuid_class,
            uuidWithBytes: uuid.0.as_ptr() as *const c_void,
            length: 16usize
        ];
        let target = target.ok_or_else(|| io_error(crate::sys::KIO_RETURN_ABORTED))?;

        let status: IOReturn = msg_send![&*device, performSDPQuery: std::ptr::null_mut::<AnyObject>()];
        if status != KIO_RETURN_SUCCESS {
            return Err(io_error(status));
        }

        let services: Option<Retained<NSArray<AnyObject>>> = msg_send![&*device, services];
        let Some(services) = services else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        for record in services.iter() {
            let matches: bool = msg_send![&*record, hasServiceFromArray: &*NSArray::from_retained_slice(&[target.clone()])];
            if !matches {
                continue;
            }
            if let Some(result) = walk_record(&record) {
                results.push(result);
            }
        }
        Ok(results)
    }
}

// SDP attribute ids (Bluetooth Assigned Numbers).
const ATTR_SERVICE_CLASS_ID_LIST: u16 = 0x0001;
const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
const ATTR_PROFILE_DESCRIPTOR_LIST: u16 = 0x0009;

unsafe fn walk_record(record: &AnyObject) -> Option<SdpResult> {
    let mut result = SdpResult::default();

    // The port is required for connecting; prefer RFCOMM, fall back to
    // the L2CAP PSM.
    let mut channel: u8 = 0;
    let rfcomm: IOReturn = msg_send![record, getRFCOMMChannelID: &mut channel];
    let mut psm: u16 = 0;
    let l2cap: IOReturn = msg_send![record, getL2CAPPSM: &mut psm];
    if rfcomm == KIO_RETURN_SUCCESS {
        result.port = u16::from(channel);
    } else if l2cap == KIO_RETURN_SUCCESS {
        result.port = psm;
    }

    let protos = attribute_sequence(record, ATTR_PROTOCOL_DESCRIPTOR_LIST)?;
    for descriptor in protos {
        let Some(elements) = array_value(&descriptor) else {
            continue;
        };
        for element in elements.iter() {
            if let Some(short) = uuid16_value(&element) {
                result.proto_uuids.push(short);
            }
        }
    }
    if !result.proto_uuids.contains(&RFCOMM_PROTO_UUID)
        && !result.proto_uuids.contains(&L2CAP_PROTO_UUID)
    {
        return None;
    }

    if let Some(classes) = attribute_sequence(record, ATTR_SERVICE_CLASS_ID_LIST) {
        for class in classes {
            if let Some(short) = uuid16_value(&class) {
                result.service_uuids.push(uuid_from_base(u32::from(short)));
            } else if let Some(full) = uuid128_value(&class) {
                result.service_uuids.push(full);
            }
        }
    }

    if let Some(profiles) = attribute_sequence(record, ATTR_PROFILE_DESCRIPTOR_LIST) {
        for profile in profiles {
            let Some(pair) = array_value(&profile) else {
                continue;
            };
            let mut uuid = 0u16;
            let mut version = 0u16;
            for item in pair.iter() {
                if let Some(short) = uuid16_value(&item) {
                    uuid = short;
                } else if let Some(number) = number_value(&item) {
                    version = number as u16;
                }
            }
            result.profile_descs.push(ProfileDesc::from_parts(uuid, version));
        }
    }

    let name: Option<Retained<NSString>> = msg_send![record, getServiceName];
    result.name = name.map(|n| n.to_string()).unwrap_or_default();

    Some(result)
}

unsafe fn attribute_sequence(
    record: &AnyObject,
    attr: u16,
) -> Option<Vec<Retained<AnyObject>>> {
    let element: Option<Retained<AnyObject>> = msg_send![record, getAttributeDataElement: attr];
    let element = element?;
    let array = array_value(&element)?;
    Some(array.iter().collect())
}

unsafe fn array_value(element: &AnyObject) -> Option<Retained<NSArray<AnyObject>>> {
    msg_send![element, getArrayValue]
}

unsafe fn uuid16_value(element: &AnyObject) -> Option<u16> {
    let uuid: Option<Retained<AnyObject>> = msg_send![element, getUUIDValue];
    let uuid = uuid?;
    let short: Option<Retained<AnyObject>> = msg_send![&*uuid, getUUIDWithLength: 2u32];
    let short = short?;
    let bytes: *const u8 = msg_send![&*short, bytes];
    Some(u16::from_be_bytes([*bytes, *bytes.add(1)]))
}

unsafe fn uuid128_value(element: &AnyObject) -> Option<Uuid128> {
    let uuid: Option<Retained<AnyObject>> = msg_send![element, getUUIDValue];
    let uuid = uuid?;
    let full: Option<Retained<AnyObject>> = msg_send![&*uuid, getUUIDWithLength: 16u32];
    let full = full?;
    let bytes: *const u8 = msg_send![&*full, bytes];
    let mut out = [0u8; 16];
    std::ptr::copy_nonoverlapping(bytes, out.as_mut_ptr(), 16);
    Some(Uuid128(out))
}

unsafe fn number_value(element: &AnyObject) -> Option<u32> {
    let number: Option<Retained<AnyObject>> = msg_send![element, getNumberValue];
    let number = number?;
    let value: u32 = msg_send![&*number, unsignedIntValue];
    Some(value)
}
