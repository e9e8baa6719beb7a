//! C2: the `.mod` binary container — magic, fixed header, a table of contents,
//! and a flat data region holding CODE/STRINGS/CLASSES/DEBUG/APP sections.
//!
//! Grounded on `other_examples/f4b9b521_..._bytecode_writer.rs.rs`'s manual
//! `put_*`/`std::io::Write` byte discipline and stub/patch-back pattern for
//! offsets unknown until the rest of the payload has been written, and on
//! `messense-llvm-bitcode-rs/src/bitstream.rs` for the general shape of a
//! section-oriented, index-then-read container.
//!
//! **Header layout note.** The format's own description gives `header_size`
//! and `toc_offset` the fixed value 64, but also places `entry_point` at byte
//! offset 64 with 8 bytes of width — i.e. 72 bytes of header actually precede
//! the TOC, not 64. We keep `header_size`'s on-disk *value* at the literal 64
//! (so a reader keying off that field's stated meaning still finds the field
//! layout it expects up to that point) but compute `toc_offset` as the real
//! 72, so the TOC is never overlapped by `entry_point`. See DESIGN.md.

use crate::error::ModuleError;
use crate::instruction::Instruction;
use crate::linker::LinkedModule;
use crate::manifest::{ClassManifest, DebugEntry, StringTable, SymbolEntry, SymbolKind, SYMBOL_ENTRY_LEN};

/// `Header.flags` bit 0: set when the module carries a non-empty DEBUG section.
const FLAG_HAS_DEBUG: u32 = 1 << 0;

pub const MAGIC: [u8; 8] = *b"ARXMOD\0\0";
pub const VERSION: u32 = 1;
/// The value written to the on-disk `header_size` field. Kept at the format's
/// documented literal even though the real physical header is
/// [`HEADER_LEN`] bytes; see the module-level doc comment.
pub const DECLARED_HEADER_SIZE: u64 = 64;
pub const HEADER_LEN: usize = 72;
pub const TOC_ENTRY_LEN: usize = 32;
pub const SECTION_NAME_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Header {
    version: u32,
    flags: u32,
    toc_offset: u64,
    toc_size: u64,
    data_offset: u64,
    data_size: u64,
    app_name_len: u32,
    app_data_size: u32,
    entry_point: u64,
}

impl Header {
    fn write_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&DECLARED_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&self.toc_offset.to_le_bytes());
        buf.extend_from_slice(&self.toc_size.to_le_bytes());
        buf.extend_from_slice(&self.data_offset.to_le_bytes());
        buf.extend_from_slice(&self.data_size.to_le_bytes());
        buf.extend_from_slice(&self.app_name_len.to_le_bytes());
        buf.extend_from_slice(&self.app_data_size.to_le_bytes());
        buf.extend_from_slice(&self.entry_point.to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_LEN);
    }

    fn read_from(bytes: &[u8]) -> Result<Header, ModuleError> {
        if bytes.len() < HEADER_LEN {
            return Err(ModuleError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(ModuleError::BadMagic);
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(ModuleError::UnknownVersion {
                found: version,
                expected: VERSION,
            });
        }
        let flags = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        // bytes[16..24] is the declared header_size; preserved on write, ignored on
        // read, since the real header length is this format's fixed HEADER_LEN.
        let toc_offset = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let toc_size = u64::from_le_bytes(bytes[32..40].try_into().unwrap());
        let data_offset = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
        let data_size = u64::from_le_bytes(bytes[48..56].try_into().unwrap());
        let app_name_len = u32::from_le_bytes(bytes[56..60].try_into().unwrap());
        let app_data_size = u32::from_le_bytes(bytes[60..64].try_into().unwrap());
        let entry_point = u64::from_le_bytes(bytes[64..72].try_into().unwrap());
        Ok(Header {
            version,
            flags,
            toc_offset,
            toc_size,
            data_offset,
            data_size,
            app_name_len,
            app_data_size,
            entry_point,
        })
    }
}

fn pack_section_name(name: &str) -> [u8; SECTION_NAME_LEN] {
    let mut buf = [0u8; SECTION_NAME_LEN];
    let bytes = name.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

fn unpack_section_name(buf: &[u8; SECTION_NAME_LEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(SECTION_NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

struct TocEntry {
    name: String,
    offset: u64,
    size: u64,
}

/// A fully assembled program, ready to be serialized to or read back from a
/// `.mod` file. Everything in here is already linked: method offsets and
/// field offsets are concrete, not symbolic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub app_name: String,
    pub entry_point: u64,
    pub code: Vec<Instruction>,
    pub strings: StringTable,
    pub classes: Vec<ClassManifest>,
    pub debug: Vec<DebugEntry>,
}

impl Module {
    pub fn from_linked(linked: LinkedModule, app_name: String) -> Module {
        Module {
            app_name,
            entry_point: linked.entry_point,
            code: linked.code,
            strings: linked.strings,
            classes: linked.classes,
            debug: linked.debug,
        }
    }

    /// One `Class` symbol per class plus one `Method` symbol per method,
    /// derived entirely from `self.classes` — never stored, always rebuilt.
    fn symbols(&self) -> Vec<SymbolEntry> {
        let mut symbols = Vec::new();
        for class in &self.classes {
            symbols.push(SymbolEntry {
                name: class.entry.name.clone(),
                offset: class.entry.class_id,
                kind: SymbolKind::Class,
            });
            for method in &class.methods {
                symbols.push(SymbolEntry {
                    name: format!("{}.{}", class.entry.name, method.name),
                    offset: method.offset,
                    kind: SymbolKind::Method,
                });
            }
        }
        symbols
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::error::CodegenError> {
        let mut code_bytes = Vec::with_capacity(self.code.len() * Instruction::LEN);
        for insn in &self.code {
            code_bytes.extend_from_slice(&insn.to_bytes());
        }
        let mut string_bytes = Vec::new();
        self.strings.write_into(&mut string_bytes);
        let mut class_bytes = Vec::new();
        for c in &self.classes {
            c.write_into(&mut class_bytes)?;
        }
        let mut debug_bytes = Vec::new();
        for d in &self.debug {
            debug_bytes.extend_from_slice(&d.to_bytes());
        }
        let mut app_bytes = Vec::new();
        app_bytes.extend_from_slice(self.app_name.as_bytes());
        let mut symbol_bytes = Vec::new();
        for s in self.symbols() {
            symbol_bytes.extend_from_slice(&s.to_bytes()?);
        }

        let sections: [(&str, &[u8]); 6] = [
            ("CODE", &code_bytes),
            ("STRINGS", &string_bytes),
            ("CLASSES", &class_bytes),
            ("SYMBOLS", &symbol_bytes),
            ("DEBUG", &debug_bytes),
            ("APP", &app_bytes),
        ];

        let toc_offset = HEADER_LEN as u64;
        let toc_size = (sections.len() * TOC_ENTRY_LEN) as u64;
        let data_offset = toc_offset + toc_size;

        let mut toc = Vec::new();
        let mut data = Vec::new();
        for (name, bytes) in sections {
            toc.extend_from_slice(&pack_section_name(name));
            toc.extend_from_slice(&(data_offset + data.len() as u64).to_le_bytes());
            toc.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            data.extend_from_slice(bytes);
        }

        let flags = if debug_bytes.is_empty() { 0 } else { FLAG_HAS_DEBUG };
        let header = Header {
            version: VERSION,
            flags,
            toc_offset,
            toc_size,
            data_offset,
            data_size: data.len() as u64,
            app_name_len: self.app_name.len() as u32,
            app_data_size: 0,
            entry_point: self.entry_point,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + toc.len() + data.len());
        header.write_into(&mut out);
        out.extend_from_slice(&toc);
        out.extend_from_slice(&data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Module, ModuleError> {
        let header = Header::read_from(bytes)?;

        let toc_end = header.toc_offset as usize + header.toc_size as usize;
        if bytes.len() < toc_end {
            return Err(ModuleError::Truncated {
                expected: toc_end,
                found: bytes.len(),
            });
        }
        if header.toc_size as usize % TOC_ENTRY_LEN != 0 {
            return Err(ModuleError::MisalignedSection { name: "TOC".into() });
        }

        let data_end = header.data_offset as usize + header.data_size as usize;
        if bytes.len() < data_end {
            return Err(ModuleError::Truncated {
                expected: data_end,
                found: bytes.len(),
            });
        }

        let mut entries = Vec::new();
        let mut cursor = header.toc_offset as usize;
        for _ in 0..(header.toc_size as usize / TOC_ENTRY_LEN) {
            let mut name_buf = [0u8; SECTION_NAME_LEN];
            name_buf.copy_from_slice(&bytes[cursor..cursor + SECTION_NAME_LEN]);
            let name = unpack_section_name(&name_buf);
            let offset = u64::from_le_bytes(bytes[cursor + 16..cursor + 24].try_into().unwrap());
            let size = u64::from_le_bytes(bytes[cursor + 24..cursor + 32].try_into().unwrap());
            if offset < header.data_offset || offset + size > header.data_offset + header.data_size {
                return Err(ModuleError::TocOutOfRange {
                    name,
                    offset,
                    size,
                    data_size: header.data_size,
                });
            }
            if entries.iter().any(|e: &TocEntry| e.name == name) {
                return Err(ModuleError::DuplicateSection { name });
            }
            entries.push(TocEntry { name, offset, size });
            cursor += TOC_ENTRY_LEN;
        }

        let section = |name: &str| -> Option<&[u8]> {
            entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| &bytes[e.offset as usize..(e.offset + e.size) as usize])
        };

        let code_bytes = section("CODE").ok_or_else(|| ModuleError::MissingSection { name: "CODE".into() })?;
        if code_bytes.len() % Instruction::LEN != 0 {
            return Err(ModuleError::MisalignedSection { name: "CODE".into() });
        }
        let mut code = Vec::with_capacity(code_bytes.len() / Instruction::LEN);
        for chunk in code_bytes.chunks_exact(Instruction::LEN) {
            let mut arr = [0u8; Instruction::LEN];
            arr.copy_from_slice(chunk);
            let insn = Instruction::from_bytes(arr).ok_or(ModuleError::MisalignedSection { name: "CODE".into() })?;
            code.push(insn);
        }

        let strings = section("STRINGS").map(StringTable::read_from).unwrap_or_default();

        let mut classes = Vec::new();
        if let Some(bytes) = section("CLASSES") {
            let mut at = 0;
            while at < bytes.len() {
                let (manifest, next) = ClassManifest::read_from(bytes, at)?;
                classes.push(manifest);
                at = next;
            }
        }

        if let Some(bytes) = section("SYMBOLS") {
            if bytes.len() % SYMBOL_ENTRY_LEN != 0 {
                return Err(ModuleError::MisalignedSection { name: "SYMBOLS".into() });
            }
            for chunk in bytes.chunks_exact(SYMBOL_ENTRY_LEN) {
                SymbolEntry::from_bytes(chunk)?;
            }
        }

        let mut debug = Vec::new();
        if let Some(bytes) = section("DEBUG") {
            if bytes.len() % crate::manifest::DEBUG_ENTRY_LEN != 0 {
                return Err(ModuleError::MisalignedSection { name: "DEBUG".into() });
            }
            for chunk in bytes.chunks_exact(crate::manifest::DEBUG_ENTRY_LEN) {
                debug.push(DebugEntry::from_bytes(chunk));
            }
        }

        let app_name = section("APP")
            .map(|bytes| {
                let n = (header.app_name_len as usize).min(bytes.len());
                String::from_utf8_lossy(&bytes[..n]).into_owned()
            })
            .unwrap_or_default();

        Ok(Module {
            app_name,
            entry_point: header.entry_point,
            code,
            strings,
            classes,
            debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodeGenerator;
    use crate::linker::Linker;
    use crate::manifest::{ClassEntry, NO_PARENT};
    use crate::parser::Parser;
    use crate::typechecker;
    use crate::verbosity::Verbosity;

    fn sample_module() -> Module {
        let program = Parser::parse(
            r#"
            module M;
            class Main begin
              procedure main() begin
                writeln("hi");
              end;
            end;
        "#,
            Verbosity::default(),
        )
        .unwrap();
        let table = typechecker::check_program(&program).unwrap();
        let out = CodeGenerator::new(Verbosity::default()).generate(&program, &table).unwrap();
        let linked = Linker::new(Verbosity::default()).link(out).unwrap();
        Module::from_linked(linked, "M".to_string())
    }

    #[test]
    fn round_trips_a_compiled_module() {
        let module = sample_module();
        let bytes = module.to_bytes().unwrap();
        let parsed = Module::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, module);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_module().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(Module::from_bytes(&bytes), Err(ModuleError::BadMagic)));
    }

    #[test]
    fn rejects_truncated_file() {
        let bytes = sample_module().to_bytes().unwrap();
        let err = Module::from_bytes(&bytes[..HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, ModuleError::Truncated { .. }));
    }

    #[test]
    fn sets_the_has_debug_flag_and_emits_a_symbols_section() {
        let module = sample_module();
        assert!(!module.debug.is_empty());
        let bytes = module.to_bytes().unwrap();
        let header = Header::read_from(&bytes).unwrap();
        assert_eq!(header.flags & FLAG_HAS_DEBUG, FLAG_HAS_DEBUG);

        let mut cursor = header.toc_offset as usize;
        let mut saw_symbols = false;
        for _ in 0..(header.toc_size as usize / TOC_ENTRY_LEN) {
            let mut name_buf = [0u8; SECTION_NAME_LEN];
            name_buf.copy_from_slice(&bytes[cursor..cursor + SECTION_NAME_LEN]);
            if unpack_section_name(&name_buf) == "SYMBOLS" {
                saw_symbols = true;
            }
            cursor += TOC_ENTRY_LEN;
        }
        assert!(saw_symbols);
    }

    #[test]
    fn handles_empty_optional_sections() {
        let module = Module {
            app_name: String::new(),
            entry_point: 0,
            code: vec![Instruction::ret()],
            strings: StringTable::new(),
            classes: vec![ClassManifest {
                entry: ClassEntry {
                    name: "Main".to_string(),
                    class_id: 0,
                    field_count: 0,
                    method_count: 0,
                    parent_class_id: NO_PARENT,
                    instance_size: 0,
                },
                methods: vec![],
                fields: vec![],
            }],
            debug: vec![],
        };
        let bytes = module.to_bytes().unwrap();
        let parsed = Module::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.debug, Vec::new());
    }
}
