//! Interned constants of an emitted module. String, name and type
//! constants become global variables initialized by the loader through the
//! init vtable, so the emitted function bodies can reference them like any
//! other value.

use std::collections::HashMap;
use std::fmt::Write;

#[derive(Default)]
pub struct JitConstCache {
    strings: Vec<(String, String)>,
    string_ids: HashMap<String, usize>,
    names: Vec<(String, String)>,
    name_ids: HashMap<String, usize>,
    types: Vec<(String, String)>,
    type_ids: HashMap<String, usize>,
}

impl JitConstCache {
    pub fn new() -> JitConstCache {
        JitConstCache::default()
    }

    /// Variable holding an interned string constant.
    pub fn map_string(&mut self, text: &str) -> String {
        if let Some(&index) = self.string_ids.get(text) {
            return self.strings[index].0.clone();
        }
        let index = self.strings.len();
        let var = format!("__str_{}", index);
        self.strings.push((var.clone(), text.to_owned()));
        self.string_ids.insert(text.to_owned(), index);
        var
    }

    /// Variable holding an interned name constant.
    pub fn map_name(&mut self, text: &str) -> String {
        if let Some(&index) = self.name_ids.get(text) {
            return self.names[index].0.clone();
        }
        let index = self.names.len();
        let var = format!("__name_{}", index);
        self.names.push((var.clone(), text.to_owned()));
        self.name_ids.insert(text.to_owned(), index);
        var
    }

    /// Variable holding a class-type constant, by host type name.
    pub fn map_type(&mut self, type_name: &str) -> String {
        if let Some(&index) = self.type_ids.get(type_name) {
            return self.types[index].0.clone();
        }
        let index = self.types.len();
        let var = format!("__classType_{}", index);
        self.types.push((var.clone(), type_name.to_owned()));
        self.type_ids.insert(type_name.to_owned(), index);
        var
    }

    /// Global variable declarations at the top of the file.
    pub fn print_const_vars(&self, out: &mut String) {
        for (var, _) in &self.strings {
            let _ = writeln!(out, "EngineString {};", var);
        }
        for (var, _) in &self.names {
            let _ = writeln!(out, "StringID {};", var);
        }
        for (var, _) in &self.types {
            let _ = writeln!(out, "ClassRef {};", var);
        }
        out.push('\n');
    }

    /// Initializer calls inside the module-init function.
    pub fn print_const_init(&self, out: &mut String) {
        for (var, text) in &self.strings {
            let _ = writeln!(
                out,
                "init->_fnInitStringConst(init->self, &{}, \"{}\");",
                var,
                escape_c(text)
            );
        }
        for (var, text) in &self.names {
            let _ = writeln!(
                out,
                "init->_fnInitNameConst(init->self, &{}, \"{}\");",
                var,
                escape_c(text)
            );
        }
        for (var, text) in &self.types {
            let _ = writeln!(
                out,
                "init->_fnInitTypeConst(init->self, &{}, \"{}\");",
                var,
                escape_c(text)
            );
        }
    }
}

/// Escape a Rust string into a C string literal body.
pub fn escape_c(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_interned() {
        let mut cache = JitConstCache::new();
        let a = cache.map_string("hello");
        let b = cache.map_string("hello");
        let c = cache.map_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut out = String::new();
        cache.print_const_vars(&mut out);
        assert_eq!(out.matches("EngineString").count(), 2);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_c("a\"b\\c\n"), "a\\\"b\\\\c\\n");
    }
}
