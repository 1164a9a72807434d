//! Deterministic serialization of a [`Module`] in the textual Breakpad
//! symbol format.
//!
//! The format is consumed by downstream resolvers and must stay
//! byte-stable for identical inputs: sections are emitted in a fixed
//! order (FILE, INLINE_ORIGIN, FUNC, PUBLIC, STACK CFI), records within a
//! section are sorted, hex fields are lowercase without a `0x` prefix,
//! and lines are `\n`-terminated.

use std::io::{self, Write};

use crate::module::{Inline, Module, RuleMap};

impl Module {
    /// Serialize the module.
    ///
    /// Assigns source and inline-origin ids first, then rebases every
    /// address by the load address (unless `preserve_load_address`),
    /// after applying the address-range allow-list to each item's
    /// pre-relocation primary address.
    pub fn write<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        self.assign_source_ids();

        writeln!(
            out,
            "MODULE {} {} {} {}",
            self.os, self.arch, self.id, self.name
        )?;
        if let Some(code_id) = &self.code_id {
            writeln!(out, "INFO CODE_ID {code_id}")?;
        }

        let load_address = if self.preserve_load_address {
            0
        } else {
            self.load_address
        };
        let rebase = |address: u64| address.wrapping_sub(load_address);

        // FILE records, ascending id.
        let mut files: Vec<_> = self.files.iter().filter(|f| f.source_id >= 0).collect();
        files.sort_by_key(|f| f.source_id);
        for file in files {
            writeln!(out, "FILE {} {}", file.source_id, file.name)?;
        }

        // INLINE_ORIGIN records, ascending id.
        let mut origins: Vec<_> = self.inline_origins.iter().filter(|o| o.id >= 0).collect();
        origins.sort_by_key(|o| o.id);
        for origin in origins {
            writeln!(out, "INLINE_ORIGIN {} {}", origin.id, origin.name)?;
        }

        // FUNC records with their lines and inline trees.
        let emitted = self.emitted_functions();
        let mut function_addresses = std::collections::HashSet::new();
        for &index in &emitted {
            let function = &self.functions[index];
            function_addresses.insert(function.address);

            let name = if self.prefer_extern_name {
                match self.externs.get(&function.address) {
                    Some(ext) => &ext.name,
                    None => &function.name,
                }
            } else {
                &function.name
            };
            let multiple = self.enable_multiple
                && (self.shared_function_addresses.contains(&function.address)
                    || self.externs.contains_key(&function.address));
            let marker = if multiple { "m " } else { "" };

            for range in &function.ranges {
                writeln!(
                    out,
                    "FUNC {}{:x} {:x} {:x} {}",
                    marker,
                    rebase(range.address),
                    range.size,
                    function.parameter_size,
                    name
                )?;
                for line in function.lines.iter().filter(|l| range.contains(l.address)) {
                    writeln!(
                        out,
                        "{:x} {:x} {} {}",
                        rebase(line.address),
                        line.size,
                        line.number,
                        self.files[line.file.0].source_id
                    )?;
                }
            }
            self.write_inlines(out, &function.inlines, load_address)?;
        }

        // PUBLIC records, ascending address. An extern colocated with an
        // emitted function is covered by the FUNC record.
        for ext in self.externs.values() {
            if function_addresses.contains(&ext.address) || !self.address_is_in_ranges(ext.address)
            {
                continue;
            }
            let multiple =
                self.enable_multiple && self.shared_extern_addresses.contains(&ext.address);
            writeln!(
                out,
                "PUBLIC {}{:x} {:x} {}",
                if multiple { "m " } else { "" },
                rebase(ext.address),
                ext.parameter_size,
                ext.name
            )?;
        }

        // STACK CFI records, ascending address. An entry whose start is
        // allowed is written whole even if its size extends past the
        // allow-list.
        let mut entries: Vec<_> = self
            .stack_frame_entries
            .iter()
            .filter(|e| self.address_is_in_ranges(e.address))
            .collect();
        entries.sort_by_key(|e| e.address);
        for entry in entries {
            writeln!(
                out,
                "STACK CFI INIT {:x} {:x} {}",
                rebase(entry.address),
                entry.size,
                format_rules(&entry.initial_rules)
            )?;
            for (&address, rules) in &entry.rule_changes {
                writeln!(
                    out,
                    "STACK CFI {:x} {}",
                    rebase(address),
                    format_rules(rules)
                )?;
            }
        }

        Ok(())
    }

    fn write_inlines<W: Write>(
        &self,
        out: &mut W,
        inlines: &[Inline],
        load_address: u64,
    ) -> io::Result<()> {
        for inline in inlines {
            write!(
                out,
                "INLINE {} {} {} {}",
                inline.depth,
                self.files[inline.call_file.0].source_id,
                inline.call_line,
                self.inline_origins[inline.origin.0].id
            )?;
            for range in &inline.ranges {
                write!(
                    out,
                    " {:x} {:x}",
                    range.address.wrapping_sub(load_address),
                    range.size
                )?;
            }
            writeln!(out)?;
            self.write_inlines(out, &inline.children, load_address)?;
        }
        Ok(())
    }
}

fn format_rules(rules: &RuleMap) -> String {
    rules
        .iter()
        .map(|(name, expr)| format!("{name}: {expr}"))
        .collect::<Vec<_>>()
        .join(" ")
}
