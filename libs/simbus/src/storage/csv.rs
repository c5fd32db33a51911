//! CSV result backend.
//!
//! One file per `(element, channel class)`, named
//! `<element>.<suffix>.csv` inside the result directory. UTF-8, LF line
//! terminator, comma separator. The header row is `time [s]` followed
//! by `name [unit]` per channel; data rows render through
//! [`ChannelValue::to_result_string`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::core::error::{Result, SimbusError};
use crate::core::port::PortInfo;
use crate::core::units::{NO_UNIT, TIME_UNIT};
use crate::core::value::ChannelValue;
use crate::storage::backend::Backend;
use crate::storage::component_storage::ChannelClass;

pub struct CsvBackend {
    dir: PathBuf,
    store_at_runtime: bool,
    files: HashMap<(usize, usize), BufWriter<File>>,
}

impl CsvBackend {
    pub fn new(dir: PathBuf, store_at_runtime: bool) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            SimbusError::Storage(format!(
                "csv backend: could not create result directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            store_at_runtime,
            files: HashMap::new(),
        })
    }

    fn file_name(component_name: &str, class: ChannelClass) -> String {
        format!("{component_name}.{}.csv", class.suffix())
    }

    fn header_cell(info: &PortInfo) -> String {
        let unit = info.unit.as_deref().unwrap_or(NO_UNIT);
        format!("{} [{}]", info.name, unit)
    }
}

impl Backend for CsvBackend {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn store_at_runtime(&self) -> bool {
        self.store_at_runtime
    }

    fn setup_component(
        &mut self,
        component: usize,
        component_name: &str,
        class: ChannelClass,
        infos: &[PortInfo],
    ) -> Result<()> {
        let path = self.dir.join(Self::file_name(component_name, class));
        debug!("csv backend: creating {}", path.display());

        let file = File::create(&path).map_err(|e| {
            SimbusError::Storage(format!(
                "csv backend: could not create {}: {e}",
                path.display()
            ))
        })?;
        let mut writer = BufWriter::new(file);

        let mut header = format!("time [{TIME_UNIT}]");
        for info in infos {
            header.push(',');
            header.push_str(&Self::header_cell(info));
        }
        header.push('\n');
        writer.write_all(header.as_bytes())?;

        self.files.insert((component, class.index()), writer);
        Ok(())
    }

    fn store_row(&mut self, component: usize, class: ChannelClass, row: &[ChannelValue]) -> Result<()> {
        let writer = self
            .files
            .get_mut(&(component, class.index()))
            .ok_or_else(|| {
                SimbusError::Storage(format!(
                    "csv backend: no file for component {component} class {}",
                    class.suffix()
                ))
            })?;

        let mut line = String::new();
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&value.to_result_string()?);
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;

        if self.store_at_runtime {
            writer.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for writer in self.files.values_mut() {
            writer.flush()?;
        }
        self.files.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::ChannelType;

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = CsvBackend::new(dir.path().to_path_buf(), false).unwrap();

        let mut info = PortInfo::new("speed", ChannelType::Double, "sink.speed");
        info.unit = Some("m/s".into());
        backend
            .setup_component(0, "sink", ChannelClass::Out, &[info])
            .unwrap();
        backend
            .store_row(
                0,
                ChannelClass::Out,
                &[ChannelValue::Double(0.0), ChannelValue::Double(7.5)],
            )
            .unwrap();
        backend
            .store_row(
                0,
                ChannelClass::Out,
                &[ChannelValue::Double(0.1), ChannelValue::Double(7.5)],
            )
            .unwrap();
        backend.finish().unwrap();

        let content = fs::read_to_string(dir.path().join("sink.res.csv")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "time [s],speed [m/s]");
        assert_eq!(lines[1], "0.0000000000000E+00,7.5000000000000E+00");
        assert_eq!(lines[2], "1.0000000000000E-01,7.5000000000000E+00");
    }

    #[test]
    fn test_mixed_types_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = CsvBackend::new(dir.path().to_path_buf(), true).unwrap();

        let infos = vec![
            PortInfo::new("count", ChannelType::Integer, "e.count"),
            PortInfo::new("flag", ChannelType::Bool, "e.flag"),
        ];
        backend
            .setup_component(1, "mixer", ChannelClass::In, &infos)
            .unwrap();
        backend
            .store_row(
                1,
                ChannelClass::In,
                &[
                    ChannelValue::Double(0.25),
                    ChannelValue::Integer(-3),
                    ChannelValue::Bool(true),
                ],
            )
            .unwrap();
        backend.finish().unwrap();

        let content = fs::read_to_string(dir.path().join("mixer.in.csv")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(
            content.lines().nth(1).unwrap(),
            "2.5000000000000E-01,-3,1"
        );
    }

    #[test]
    fn test_unknown_component_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = CsvBackend::new(dir.path().to_path_buf(), false).unwrap();
        assert!(
            backend
                .store_row(9, ChannelClass::Out, &[ChannelValue::Double(0.0)])
                .is_err()
        );
    }
}
