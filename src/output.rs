//! Output records and the writers that serialize them.
//!
//! The engine keeps sampled rows and firing records in memory; everything
//! here takes a caller-supplied stream, so file layout and lifecycle stay
//! outside the core.

use std::io::{self, Write};

use crate::system::Simulation;

/// One sampled output row: observable values (and global function values when
/// enabled) at a sample time.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleRow {
    pub time: f64,
    pub events: u64,
    pub values: Vec<f64>,
}

/// One recorded rule firing.
#[derive(Clone, Debug, PartialEq)]
pub struct FiringRecord {
    pub event_index: u64,
    pub time: f64,
    pub rule_id: usize,
    pub rule_name: String,
    pub reactant_uids: Vec<u64>,
    pub product_uids: Vec<u64>,
}

/// Write the sampled trace as a delimited table, tab- or comma-separated.
pub fn write_trace<W: Write>(sim: &Simulation, w: &mut W, csv: bool) -> io::Result<()> {
    let sep = if csv { "," } else { "\t" };
    write!(w, "time")?;
    for name in sim.sample_columns() {
        write!(w, "{}{}", sep, name)?;
    }
    writeln!(w)?;
    for row in sim.trace() {
        write!(w, "{}", row.time)?;
        for v in &row.values {
            write!(w, "{}{}", sep, v)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Write the sampled trace in the compact binary encoding: consecutive
/// little-endian f64 rows of `time` followed by the column values.
pub fn write_trace_binary<W: Write>(sim: &Simulation, w: &mut W) -> io::Result<()> {
    for row in sim.trace() {
        w.write_all(&row.time.to_le_bytes())?;
        for v in &row.values {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Write the firing log as a tab-separated table. With `numeric` set, rules
/// appear as ids instead of names to keep files small.
pub fn write_firing_log<W: Write>(sim: &Simulation, w: &mut W, numeric: bool) -> io::Result<()> {
    writeln!(w, "event\ttime\trule\treactants\tproducts")?;
    for rec in sim.firing_records() {
        let uids = |v: &[u64]| {
            v.iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        if numeric {
            write!(w, "{}\t{}\t{}", rec.event_index, rec.time, rec.rule_id)?;
        } else {
            write!(w, "{}\t{}\t{}", rec.event_index, rec.time, rec.rule_name)?;
        }
        writeln!(w, "\t{}\t{}", uids(&rec.reactant_uids), uids(&rec.product_uids))?;
    }
    Ok(())
}

/// Write the molecule-type and rule index tables used to decode numeric logs.
pub fn write_index_tables<W: Write>(sim: &Simulation, w: &mut W) -> io::Result<()> {
    writeln!(w, "# molecule types")?;
    writeln!(w, "id\tname\tcount")?;
    for (id, name, count) in sim.molecule_type_table() {
        writeln!(w, "{}\t{}\t{}", id, name, count)?;
    }
    writeln!(w, "# rules")?;
    writeln!(w, "id\tname\tfirings")?;
    for (id, name, firings) in sim.rule_table() {
        writeln!(w, "{}\t{}\t{}", id, name, firings)?;
    }
    Ok(())
}
