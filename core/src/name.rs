//! Interned identifier names. A [Name] is a cheap, copyable handle into a
//! process-wide intern table, so name equality is an integer compare and
//! names can live inside raw value storage (the runtime treats them as a
//! 4-byte simple-copy type).

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
    sync::Mutex,
};

/// Handle to an interned string. `Name::default()` is the empty name, which
/// every table reserves at index 0.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

struct Interner {
    by_text: HashMap<&'static str, u32>,
    texts: Vec<&'static str>,
}

fn interner() -> &'static Mutex<Interner> {
    use std::sync::OnceLock;
    static TABLE: OnceLock<Mutex<Interner>> = OnceLock::new();
    TABLE.get_or_init(|| {
        Mutex::new(Interner {
            by_text: HashMap::new(),
            texts: vec![""],
        })
    })
}

impl Name {
    /// Intern a string and return its handle. Empty strings map to the
    /// reserved empty name without touching the table.
    pub fn new(text: &str) -> Name {
        if text.is_empty() {
            return Name(0);
        }
        let mut table = interner().lock().unwrap();
        if let Some(&id) = table.by_text.get(text) {
            return Name(id);
        }
        // Names live for the whole process, same as the host's interned
        // string ids whose addresses are used as keys elsewhere.
        let leaked: &'static str = Box::leak(text.to_owned().into_boxed_str());
        let id = table.texts.len() as u32;
        table.texts.push(leaked);
        table.by_text.insert(leaked, id);
        Name(id)
    }

    /// The empty name.
    pub fn none() -> Name {
        Name(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Resolve back to the interned text.
    pub fn as_str(self) -> &'static str {
        let table = interner().lock().unwrap();
        table.texts[self.0 as usize]
    }

    /// The raw table index, as stored in script value memory (names are a
    /// 4-byte simple-copy type at runtime).
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild a name from its raw index. Indices outside the table come
    /// back as the empty name.
    pub fn from_raw(raw: u32) -> Name {
        let table = interner().lock().unwrap();
        if (raw as usize) < table.texts.len() {
            Name(raw)
        } else {
            Name(0)
        }
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl From<&str> for Name {
    fn from(text: &str) -> Name {
        Name::new(text)
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Name, D::Error> {
        struct V;
        impl<'de> de::Visitor<'de> for V {
            type Value = Name;
            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a string")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Name, E> {
                Ok(Name::new(v))
            }
        }
        deserializer.deserialize_str(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let a = Name::new("Foo");
        let b = Name::new("Foo");
        let c = Name::new("Bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "Foo");
    }

    #[test]
    fn test_empty() {
        assert!(Name::new("").is_empty());
        assert_eq!(Name::default(), Name::none());
        assert_eq!(Name::none().as_str(), "");
    }

    #[test]
    fn test_raw_roundtrip() {
        let name = Name::new("Baz");
        assert_eq!(Name::from_raw(name.raw()), name);
        assert!(Name::from_raw(u32::MAX).is_empty());
    }
}
