//! Configuration manager transport (Windows).
//!
//! Interfaces are addressed by their symbolic link, devices by their instance
//! id. Notifications arrive on a system thread pool thread; the callback only
//! copies the symbolic link out of the event buffer and hands it to the
//! bridge.

use crate::{
  bridge::NotificationSink,
  class::{self, Bus, ClassGuid, Criteria},
  device::{DeviceRecord, InterfaceRecord, PropertyKey, PropertyValue},
  error::{NativeError, PropertyError, ResolutionError},
  event::{Action, RawDevice},
  identity::Identity,
  transport::{PropertyResolver, Transport},
};
use std::{ffi::c_void, fmt, iter, mem, ptr};
use tracing::{event, Level};
use windows_sys::{
  core::GUID,
  Win32::{
    Devices::{
      DeviceAndDriverInstallation::{
        CM_Get_DevNode_PropertyW, CM_Get_Device_Interface_ListW,
        CM_Get_Device_Interface_List_SizeW, CM_Get_Device_Interface_PropertyW, CM_Get_Parent,
        CM_Locate_DevNodeW, CM_Register_Notification, CM_Unregister_Notification,
        CM_GET_DEVICE_INTERFACE_LIST_PRESENT, CM_LOCATE_DEVNODE_NORMAL, CM_NOTIFY_ACTION,
        CM_NOTIFY_ACTION_DEVICEINTERFACEARRIVAL, CM_NOTIFY_ACTION_DEVICEINTERFACEREMOVAL,
        CM_NOTIFY_EVENT_DATA, CM_NOTIFY_FILTER, CM_NOTIFY_FILTER_TYPE_DEVICEINTERFACE, CONFIGRET,
        CR_BUFFER_SMALL, CR_NO_SUCH_VALUE, CR_SUCCESS, HCMNOTIFICATION,
      },
      Properties::{
        DEVPKEY_Device_Address, DEVPKEY_Device_BusNumber, DEVPKEY_Device_BusReportedDeviceDesc,
        DEVPKEY_Device_ClassGuid, DEVPKEY_Device_HardwareIds, DEVPKEY_Device_InstanceId,
        DEVPKEY_Device_Manufacturer, DEVPROPTYPE, DEVPROP_TYPE_GUID, DEVPROP_TYPE_INT32,
        DEVPROP_TYPE_STRING, DEVPROP_TYPE_STRING_LIST, DEVPROP_TYPE_UINT32,
      },
    },
    Foundation::{DEVPROPKEY, ERROR_SUCCESS},
  },
};

fn check(call: &'static str, status: CONFIGRET) -> Result<(), NativeError> {
  if status == CR_SUCCESS {
    Ok(())
  } else {
    Err(NativeError::ConfigRet { call, status })
  }
}

fn wide(text: &str) -> Vec<u16> {
  text.encode_utf16().chain(iter::once(0)).collect()
}

fn units(bytes: &[u8]) -> Vec<u16> {
  bytes
    .chunks_exact(2)
    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    .collect()
}

fn until_nul(units: &[u16]) -> String {
  let end = units.iter().position(|u| *u == 0).unwrap_or(units.len());
  String::from_utf16_lossy(&units[..end])
}

/// Splits a double-NUL terminated string list.
fn multi_sz(units: &[u16]) -> Vec<String> {
  units
    .split(|u| *u == 0)
    .take_while(|s| !s.is_empty())
    .map(String::from_utf16_lossy)
    .collect()
}

fn guid(value: ClassGuid) -> GUID {
  GUID::from_u128(value.to_u128())
}

fn class_guid(bytes: &[u8]) -> Option<ClassGuid> {
  if bytes.len() != 16 {
    return None;
  }

  let data1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u128;
  let data2 = u16::from_le_bytes([bytes[4], bytes[5]]) as u128;
  let data3 = u16::from_le_bytes([bytes[6], bytes[7]]) as u128;
  let mut data4 = [0u8; 8];
  data4.copy_from_slice(&bytes[8..]);
  let data4 = u64::from_be_bytes(data4) as u128;

  Some(ClassGuid::from_u128(
    (data1 << 96) | (data2 << 80) | (data3 << 64) | data4,
  ))
}

/// Fetches a raw property value with the usual size-then-value call pair.
fn property_bytes<F>(call: &'static str, mut get: F) -> Result<(DEVPROPTYPE, Vec<u8>), NativeError>
where
  F: FnMut(*mut DEVPROPTYPE, *mut u8, *mut u32) -> CONFIGRET,
{
  let mut kind: DEVPROPTYPE = 0;
  let mut size = 0u32;
  let status = get(&mut kind, ptr::null_mut(), &mut size);
  if status != CR_BUFFER_SMALL {
    check(call, status)?;
    return Ok((kind, Vec::new()));
  }

  let mut buffer = vec![0u8; size as usize];
  check(call, get(&mut kind, buffer.as_mut_ptr(), &mut size))?;
  buffer.truncate(size as usize);
  Ok((kind, buffer))
}

fn devnode_property(devinst: u32, key: &DEVPROPKEY) -> Result<(DEVPROPTYPE, Vec<u8>), NativeError> {
  property_bytes("CM_Get_DevNode_PropertyW", |kind, buffer, size| unsafe {
    CM_Get_DevNode_PropertyW(devinst, key, kind, buffer, size, 0)
  })
}

fn devnode_string(devinst: u32, key: &DEVPROPKEY) -> Result<Option<String>, NativeError> {
  match devnode_property(devinst, key)? {
    (DEVPROP_TYPE_STRING, bytes) => Ok(Some(until_nul(&units(&bytes)))),
    _ => Ok(None),
  }
}

fn interface_instance_id(link: &str) -> Result<String, NativeError> {
  let link = wide(link);
  let (kind, bytes) = property_bytes("CM_Get_Device_Interface_PropertyW", |kind, buffer, size| unsafe {
    CM_Get_Device_Interface_PropertyW(link.as_ptr(), &DEVPKEY_Device_InstanceId, kind, buffer, size, 0)
  })?;

  if kind != DEVPROP_TYPE_STRING {
    return Err(NativeError::Rejected {
      call: "CM_Get_Device_Interface_PropertyW",
      message: format!("unexpected property type 0x{:X}", kind),
    });
  }

  Ok(until_nul(&units(&bytes)))
}

fn locate(instance_id: &str) -> Result<u32, NativeError> {
  let id = wide(instance_id);
  let mut devinst = 0u32;
  check("CM_Locate_DevNodeW", unsafe {
    CM_Locate_DevNodeW(&mut devinst, id.as_ptr(), CM_LOCATE_DEVNODE_NORMAL)
  })?;
  Ok(devinst)
}

fn parent_of(devinst: u32) -> Option<u32> {
  let mut parent = 0u32;
  match unsafe { CM_Get_Parent(&mut parent, devinst, 0) } {
    CR_SUCCESS => Some(parent),
    _ => None,
  }
}

fn instance_id(devinst: u32) -> Result<String, NativeError> {
  devnode_string(devinst, &DEVPKEY_Device_InstanceId)?.ok_or_else(|| NativeError::Rejected {
    call: "CM_Get_DevNode_PropertyW",
    message: "instance id is not a string".into(),
  })
}

/// The device node itself, then each ancestor up to the root.
fn ancestry(devinst: u32) -> impl Iterator<Item = u32> {
  iter::successors(Some(devinst), |d| parent_of(*d))
}

fn bus_of(devinst: u32) -> Bus {
  ancestry(devinst)
    .filter_map(|d| instance_id(d).ok())
    .find_map(|id| {
      let enumerator = id.split('\\').next().unwrap_or_default().to_ascii_uppercase();
      match enumerator.as_str() {
        "USB" => Some(Bus::Usb),
        "BTHENUM" | "BTHLE" | "BTHLEDEVICE" => Some(Bus::Bluetooth),
        _ => None,
      }
    })
    .unwrap_or(Bus::Unknown)
}

fn record(devinst: u32) -> Result<DeviceRecord, NativeError> {
  // Devices without a setup class (e.g. root enumerated ones) stay unclassified.
  let class = match devnode_property(devinst, &DEVPKEY_Device_ClassGuid) {
    Ok((DEVPROP_TYPE_GUID, bytes)) => class_guid(&bytes)
      .map(class::device_class_for_guid)
      .unwrap_or(class::DeviceClass::Unknown),
    _ => class::DeviceClass::Unknown,
  };

  Ok(DeviceRecord::new(instance_id(devinst)?, class, bus_of(devinst)))
}

/// `VID`, `PID` and friends from hardware ids such as
/// `USB\VID_046D&PID_C52B&REV_1201`.
fn hardware_id_param(devinst: u32, name: &str) -> Result<Option<String>, NativeError> {
  let ids = match devnode_property(devinst, &DEVPKEY_Device_HardwareIds)? {
    (DEVPROP_TYPE_STRING_LIST, bytes) => multi_sz(&units(&bytes)),
    _ => return Ok(None),
  };

  Ok(ids.iter().find_map(|id| {
    id.split('\\').nth(1)?.split('&').find_map(|param| {
      let mut parts = param.splitn(2, '_');
      match (parts.next(), parts.next()) {
        (Some(n), Some(value)) if n.eq_ignore_ascii_case(name) => Some(value.to_string()),
        _ => None,
      }
    })
  }))
}

fn not_found(key: PropertyKey) -> impl FnOnce(NativeError) -> PropertyError {
  move |e| match e {
    NativeError::ConfigRet {
      status: CR_NO_SUCH_VALUE,
      ..
    } => PropertyError::NotFound(key),
    e => PropertyError::Native(e),
  }
}

fn number_property(devinst: u32, key: PropertyKey, devkey: &DEVPROPKEY) -> Result<PropertyValue, PropertyError> {
  match devnode_property(devinst, devkey).map_err(not_found(key))? {
    (DEVPROP_TYPE_UINT32, bytes) | (DEVPROP_TYPE_INT32, bytes) if bytes.len() == 4 => Ok(
      PropertyValue::Number(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
    ),
    _ => Err(PropertyError::TypeMismatch {
      key,
      expected: "number",
    }),
  }
}

fn text_property(devinst: u32, key: PropertyKey, devkey: &DEVPROPKEY) -> Result<PropertyValue, PropertyError> {
  match devnode_string(devinst, devkey).map_err(not_found(key))? {
    Some(value) => key.parse(&value),
    None => Err(PropertyError::TypeMismatch {
      key,
      expected: "text",
    }),
  }
}

struct CallbackContext {
  sink: NotificationSink,
  class_id: String,
}

unsafe extern "system" fn on_notification(
  _notification: HCMNOTIFICATION,
  context: *const c_void,
  action: CM_NOTIFY_ACTION,
  data: *const CM_NOTIFY_EVENT_DATA,
  _size: u32,
) -> u32 {
  if context.is_null() || data.is_null() {
    return ERROR_SUCCESS;
  }

  let context = &*(context as *const CallbackContext);
  let action = match action {
    CM_NOTIFY_ACTION_DEVICEINTERFACEARRIVAL => Action::Add,
    CM_NOTIFY_ACTION_DEVICEINTERFACEREMOVAL => Action::Remove,
    _ => return ERROR_SUCCESS,
  };

  // The event buffer only lives for the duration of this call.
  let link = (*data).u.DeviceInterface.SymbolicLink.as_ptr();
  let mut len = 0;
  while *link.add(len) != 0 {
    len += 1;
  }
  let link = String::from_utf16_lossy(std::slice::from_raw_parts(link, len));

  context
    .sink
    .notify(action, RawDevice::new(link).with_class_id(context.class_id.clone()));
  ERROR_SUCCESS
}

struct Notification(HCMNOTIFICATION);

// SAFETY: the handle is only passed back to CM_Unregister_Notification, which
// may be called from any thread.
unsafe impl Send for Notification {}

/// One configuration manager notification registration.
pub struct WindowsWatch {
  notification: Option<Notification>,
  context: Box<CallbackContext>,
}

impl WindowsWatch {
  fn unregister(&mut self) -> Result<(), NativeError> {
    match self.notification.take() {
      None => Ok(()),
      // Blocks until running callbacks for this registration have returned.
      Some(notification) => check("CM_Unregister_Notification", unsafe {
        CM_Unregister_Notification(notification.0)
      }),
    }
  }
}

impl fmt::Debug for WindowsWatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WindowsWatch")
      .field("class_id", &self.context.class_id)
      .field("registered", &self.notification.is_some())
      .finish()
  }
}

impl Drop for WindowsWatch {
  fn drop(&mut self) {
    if let Err(e) = self.unregister() {
      event!(
        target: "hotplug",
        Level::ERROR,
        error = %e,
        class_id = %self.context.class_id,
        "failed to unregister notification"
      );
    }
  }
}

/// Transport on top of the configuration manager API.
#[derive(Debug, Clone, Copy)]
pub struct WindowsTransport {
  _private: (),
}

impl WindowsTransport {
  pub fn new() -> Result<Self, NativeError> {
    Ok(WindowsTransport { _private: () })
  }

  fn interface_guid(call: &'static str, criteria: &Criteria) -> Result<ClassGuid, NativeError> {
    criteria.guid.ok_or_else(|| NativeError::Rejected {
      call,
      message: format!("no interface class GUID for {}", criteria.subsystem),
    })
  }
}

impl PropertyResolver for WindowsTransport {
  fn property(&self, device: Identity, key: PropertyKey) -> Result<PropertyValue, PropertyError> {
    let devinst = locate(device.as_str())?;
    match key {
      PropertyKey::BusNumber => number_property(devinst, key, &DEVPKEY_Device_BusNumber),
      PropertyKey::Address => number_property(devinst, key, &DEVPKEY_Device_Address),
      PropertyKey::Manufacturer => text_property(devinst, key, &DEVPKEY_Device_Manufacturer),
      PropertyKey::Product => text_property(devinst, key, &DEVPKEY_Device_BusReportedDeviceDesc),
      PropertyKey::VendorId | PropertyKey::ProductId => {
        let name = if key == PropertyKey::VendorId { "VID" } else { "PID" };
        for node in ancestry(devinst) {
          if let Some(value) = hardware_id_param(node, name).map_err(not_found(key))? {
            return key.parse(&value);
          }
        }

        Err(PropertyError::NotFound(key))
      }
      PropertyKey::SerialNumber => {
        // USB devices with a serial number use it as the last instance id segment.
        let usb = ancestry(devinst)
          .filter_map(|d| instance_id(d).ok())
          .find(|id| id.to_ascii_uppercase().starts_with("USB\\"))
          .ok_or(PropertyError::NotFound(key))?;
        match usb.rsplit('\\').next() {
          Some(serial) if !serial.contains('&') => key.parse(serial),
          _ => Err(PropertyError::NotFound(key)),
        }
      }
    }
  }

  fn parent(&self, device: Identity) -> Result<DeviceRecord, PropertyError> {
    let devinst = locate(device.as_str())?;
    let parent = parent_of(devinst).ok_or(PropertyError::NoParent)?;
    Ok(record(parent)?)
  }
}

impl Transport for WindowsTransport {
  type Watch = WindowsWatch;

  fn register_watch(
    &self,
    criteria: &'static Criteria,
    sink: NotificationSink,
  ) -> Result<Self::Watch, NativeError> {
    let class_guid = Self::interface_guid("CM_Register_Notification", criteria)?;
    let mut watch = WindowsWatch {
      notification: None,
      context: Box::new(CallbackContext {
        sink,
        class_id: class_guid.to_string(),
      }),
    };

    let mut handle: HCMNOTIFICATION = unsafe { mem::zeroed() };
    let status = unsafe {
      let mut filter: CM_NOTIFY_FILTER = mem::zeroed();
      filter.cbSize = mem::size_of::<CM_NOTIFY_FILTER>() as u32;
      filter.FilterType = CM_NOTIFY_FILTER_TYPE_DEVICEINTERFACE;
      filter.u.DeviceInterface.ClassGuid = guid(class_guid);

      CM_Register_Notification(
        &filter,
        &*watch.context as *const CallbackContext as *const c_void,
        Some(on_notification),
        &mut handle,
      )
    };
    check("CM_Register_Notification", status)?;

    watch.notification = Some(Notification(handle));
    Ok(watch)
  }

  fn unregister_watch(&self, mut watch: Self::Watch) -> Result<(), NativeError> {
    watch.unregister()
  }

  fn enumerate(&self, criteria: &Criteria) -> Result<Vec<RawDevice>, NativeError> {
    let class_guid = Self::interface_guid("CM_Get_Device_Interface_ListW", criteria)?;
    let native = guid(class_guid);

    // The list can grow between the size query and the list query.
    let buffer = loop {
      let mut len = 0u32;
      check("CM_Get_Device_Interface_List_SizeW", unsafe {
        CM_Get_Device_Interface_List_SizeW(
          &mut len,
          &native,
          ptr::null(),
          CM_GET_DEVICE_INTERFACE_LIST_PRESENT,
        )
      })?;

      let mut buffer = vec![0u16; len as usize];
      let status = unsafe {
        CM_Get_Device_Interface_ListW(
          &native,
          ptr::null(),
          buffer.as_mut_ptr(),
          len,
          CM_GET_DEVICE_INTERFACE_LIST_PRESENT,
        )
      };

      if status != CR_BUFFER_SMALL {
        check("CM_Get_Device_Interface_ListW", status)?;
        break buffer;
      }
    };

    let class_id = class_guid.to_string();
    Ok(
      multi_sz(&buffer)
        .into_iter()
        .map(|link| RawDevice::new(link).with_class_id(class_id.clone()))
        .collect(),
    )
  }

  fn resolve(&self, raw: &RawDevice, criteria: &Criteria) -> Result<InterfaceRecord, ResolutionError> {
    let expected = criteria.guid;
    let actual = raw.class_id.as_deref().and_then(|id| id.parse::<ClassGuid>().ok());
    if expected.is_none() || actual != expected {
      return Err(ResolutionError::Mismatch(raw.identity.clone()));
    }

    let vanished = |_| ResolutionError::Vanished(raw.identity.clone());
    let instance_id = interface_instance_id(&raw.identity).map_err(vanished)?;
    let devinst = locate(&instance_id).map_err(vanished)?;

    Ok(InterfaceRecord {
      path: Identity::new(&raw.identity),
      device: record(devinst)?,
    })
  }
}
