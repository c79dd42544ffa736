use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use npyz::{DType, Order, WriterBuilder};

use crate::error::{Result, SpoolError};

const I32_DESCR: &str = "<i4";

pub fn write_i32_array(path: &Path, values: &[i32]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut writer = npyz::WriteOptions::new()
        .default_dtype()
        .shape(&[values.len() as u64])
        .writer(&mut out)
        .begin_nd()?;
    for value in values {
        writer.push(value)?;
    }
    writer.finish()?;
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

pub fn read_i32_array(path: &Path) -> Result<Vec<i32>> {
    let invalid = |reason: String| SpoolError::InvalidShard {
        path: path.to_path_buf(),
        reason,
    };
    let file_len = fs::metadata(path)?.len();
    let npy = npyz::NpyFile::new(BufReader::new(File::open(path)?))
        .map_err(|e| invalid(format!("unreadable npy header: {e}")))?;

    match npy.dtype() {
        DType::Plain(ty) if ty.to_string() == I32_DESCR => {}
        other => return Err(invalid(format!("expected '{I32_DESCR}' dtype, found {other:?}"))),
    }
    if matches!(npy.order(), Order::Fortran) {
        return Err(invalid("fortran-ordered arrays are not supported".to_string()));
    }
    let &[len] = npy.shape() else {
        return Err(invalid(format!(
            "expected a 1-D array, shape was {:?}",
            npy.shape()
        )));
    };
    if len.checked_mul(4).map_or(true, |bytes| bytes > file_len) {
        return Err(invalid(format!(
            "shape ({len},) does not fit in a {file_len}-byte file"
        )));
    }

    npy.into_vec::<i32>()
        .map_err(|e| invalid(format!("unreadable npy body: {e}")))
}
