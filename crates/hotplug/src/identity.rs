use lasso::{Spur, ThreadedRodeo};
use once_cell::sync::Lazy;
use std::{borrow::Borrow, cmp::Ordering, fmt, hash, ops::Deref};

static IDENTITIES: Lazy<ThreadedRodeo> = Lazy::new(Default::default);

/// Interned identity string of a device or device interface.
///
/// Identities are stable across an arrival and its matching departure, which
/// makes them the key of the detach correlation table. Interning keeps them
/// `Copy` so events and devices can carry them around freely.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Identity(Spur);

impl Identity {
  pub fn new<T>(text: T) -> Identity
  where
    T: AsRef<str>,
  {
    Identity(IDENTITIES.get_or_intern(text))
  }

  pub fn new_static(text: &'static str) -> Identity {
    Identity(IDENTITIES.get_or_intern_static(text))
  }

  /// The identity for `text` if it was interned before. Never interns.
  pub fn lookup(text: &str) -> Option<Identity> {
    IDENTITIES.get(text).map(Identity)
  }

  #[inline(always)]
  pub fn as_str(&self) -> &str {
    IDENTITIES.resolve(&self.0)
  }
}

impl Deref for Identity {
  type Target = str;

  fn deref(&self) -> &str {
    self.as_str()
  }
}

impl PartialEq for Identity {
  fn eq(&self, other: &Identity) -> bool {
    self.0 == other.0
  }
}

impl Eq for Identity {}

impl PartialEq<str> for Identity {
  fn eq(&self, other: &str) -> bool {
    self.as_str() == other
  }
}

impl<'a> PartialEq<&'a str> for Identity {
  fn eq(&self, other: &&'a str) -> bool {
    self.as_str() == *other
  }
}

impl Ord for Identity {
  fn cmp(&self, other: &Identity) -> Ordering {
    self.as_str().cmp(other.as_str())
  }
}

impl PartialOrd for Identity {
  fn partial_cmp(&self, other: &Identity) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl hash::Hash for Identity {
  fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
    self.as_str().hash(hasher)
  }
}

impl fmt::Debug for Identity {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Debug::fmt(self.as_str(), f)
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Display::fmt(self.as_str(), f)
  }
}

impl<'a> From<&'a str> for Identity {
  fn from(text: &'a str) -> Self {
    Self::new(text)
  }
}

impl From<String> for Identity {
  fn from(text: String) -> Self {
    Self::new(text)
  }
}

impl Borrow<str> for Identity {
  fn borrow(&self) -> &str {
    self.as_str()
  }
}

mod serde {
  use super::Identity;
  use serde::{
    de::{Error, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
  };

  impl Serialize for Identity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
      S: Serializer,
    {
      self.as_str().serialize(serializer)
    }
  }

  struct IdentityVisitor;
  impl<'de> Visitor<'de> for IdentityVisitor {
    type Value = Identity;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
      formatter.write_str("a device identity string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
      E: Error,
    {
      Ok(Identity::new(v))
    }
  }

  impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
      D: Deserializer<'de>,
    {
      deserializer.deserialize_str(IdentityVisitor)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_test::{assert_tokens, Token};

  #[test]
  fn identity_serde() {
    assert_tokens(&Identity::new_static("/dev/hidraw0"), &[Token::Str("/dev/hidraw0")]);
  }

  #[test]
  fn same_text_same_identity() {
    let a = Identity::new(String::from("/sys/devices/pci0000:00/usb1/1-1"));
    let b = Identity::new("/sys/devices/pci0000:00/usb1/1-1");
    assert_eq!(a, b);
    assert_eq!(a, "/sys/devices/pci0000:00/usb1/1-1");
    assert_ne!(a, Identity::new("/sys/devices/pci0000:00/usb1/1-2"));
  }

  #[test]
  fn lookup_does_not_intern() {
    let text = "/dev/bus/usb/007/113-lookup";
    assert_eq!(Identity::lookup(text), None);
    assert_eq!(Identity::lookup(text), None);

    let identity = Identity::new(text);
    assert_eq!(Identity::lookup(text), Some(identity));
  }
}
