use std::path::{Path, PathBuf};

use crate::error::{ModuleLoadError, ModuleLoadErrorKind};
use crate::module::ModuleVersion;
use crate::strings::{IStr, StringPool};
use crate::token::Token;

/// Strings at most this long are decoded through a stack buffer before being
/// interned; longer ones take a heap allocation.
const MAX_SHORT_STRING: usize = 128;

enum ReaderData {
	#[cfg(feature = "memmap2")]
	Mapped(memmap2::Mmap),
	Owned(Vec<u8>),
}

impl ReaderData {
	fn bytes(&self) -> &[u8] {
		match self {
			#[cfg(feature = "memmap2")]
			ReaderData::Mapped(map) => map,
			ReaderData::Owned(bytes) => bytes,
		}
	}
}

/// A little-endian, seek-capable reader over a module file. The file contents
/// are mapped (or read) once; every value handed out is copied or interned,
/// so the mapping can be released as soon as the reader is dropped.
pub struct ModuleReader {
	data: ReaderData,
	pos: usize,
	file_name: PathBuf,
}

impl ModuleReader {
	#[cfg(feature = "memmap2")]
	pub fn open(path: impl AsRef<Path>) -> Result<Self, ModuleLoadError> {
		let path = path.as_ref();
		let map_file = || -> std::io::Result<memmap2::Mmap> {
			let file = std::fs::File::open(path)?;
			unsafe { memmap2::Mmap::map(&file) }
		};
		match map_file() {
			Ok(map) => Ok(Self {
				data: ReaderData::Mapped(map),
				pos: 0,
				file_name: path.to_path_buf(),
			}),
			Err(err) => Err(ModuleLoadError::new(path, ModuleLoadErrorKind::Io(err))),
		}
	}

	#[cfg(not(feature = "memmap2"))]
	pub fn open(path: impl AsRef<Path>) -> Result<Self, ModuleLoadError> {
		let path = path.as_ref();
		match std::fs::read(path) {
			Ok(bytes) => Ok(Self {
				data: ReaderData::Owned(bytes),
				pos: 0,
				file_name: path.to_path_buf(),
			}),
			Err(err) => Err(ModuleLoadError::new(path, ModuleLoadErrorKind::Io(err))),
		}
	}

	pub fn from_bytes(bytes: Vec<u8>, file_name: impl AsRef<Path>) -> Self {
		Self {
			data: ReaderData::Owned(bytes),
			pos: 0,
			file_name: file_name.as_ref().to_path_buf(),
		}
	}

	#[inline]
	pub fn file_name(&self) -> &Path {
		&self.file_name
	}

	/// Wraps an error kind with this reader's file name.
	pub fn error(&self, kind: ModuleLoadErrorKind) -> ModuleLoadError {
		ModuleLoadError::new(&self.file_name, kind)
	}

	#[inline]
	pub fn position(&self) -> usize {
		self.pos
	}

	pub fn seek_to(&mut self, position: usize) {
		self.pos = position;
	}

	pub fn skip(&mut self, count: usize) -> Result<(), ModuleLoadError> {
		if self.pos + count > self.data.bytes().len() {
			return Err(self.error(ModuleLoadErrorKind::UnexpectedEndOfFile));
		}
		self.pos += count;
		Ok(())
	}

	pub fn read_slice(&mut self, count: usize) -> Result<&[u8], ModuleLoadError> {
		let bytes = self.data.bytes();
		let end = self.pos.checked_add(count).filter(|end| *end <= bytes.len());
		match end {
			Some(end) => {
				let slice = &bytes[self.pos..end];
				self.pos = end;
				Ok(slice)
			}
			None => Err(ModuleLoadError::new(
				&self.file_name,
				ModuleLoadErrorKind::UnexpectedEndOfFile,
			)),
		}
	}

	pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ModuleLoadError> {
		let mut out = [0u8; N];
		out.copy_from_slice(self.read_slice(N)?);
		Ok(out)
	}

	pub fn read_u8(&mut self) -> Result<u8, ModuleLoadError> {
		Ok(self.read_array::<1>()?[0])
	}

	pub fn read_u16(&mut self) -> Result<u16, ModuleLoadError> {
		Ok(u16::from_le_bytes(self.read_array()?))
	}

	pub fn read_u32(&mut self) -> Result<u32, ModuleLoadError> {
		Ok(u32::from_le_bytes(self.read_array()?))
	}

	pub fn read_i32(&mut self) -> Result<i32, ModuleLoadError> {
		Ok(i32::from_le_bytes(self.read_array()?))
	}

	pub fn read_i64(&mut self) -> Result<i64, ModuleLoadError> {
		Ok(i64::from_le_bytes(self.read_array()?))
	}

	pub fn read_token_raw(&mut self) -> Result<u32, ModuleLoadError> {
		self.read_u32()
	}

	pub fn read_token(&mut self) -> Result<Token, ModuleLoadError> {
		let raw = self.read_u32()?;
		Token::try_from(raw).map_err(|_| self.error(ModuleLoadErrorKind::InvalidToken(raw)))
	}

	pub fn read_version(&mut self) -> Result<ModuleVersion, ModuleLoadError> {
		Ok(ModuleVersion {
			major: self.read_i32()?,
			minor: self.read_i32()?,
			patch: self.read_i32()?,
			revision: self.read_i32()?,
		})
	}

	/// Reads a length-prefixed UTF-16 string and interns it.
	pub fn read_string(&mut self, pool: &StringPool) -> Result<IStr, ModuleLoadError> {
		let length = self.read_i32()?;
		if length < 0 {
			return Err(self.error(ModuleLoadErrorKind::InvalidString));
		}
		self.read_string_payload(length as usize, pool)
	}

	/// Like `read_string`, but a length of 0 means "absent".
	pub fn read_string_or_null(&mut self, pool: &StringPool) -> Result<Option<IStr>, ModuleLoadError> {
		let length = self.read_i32()?;
		if length < 0 {
			return Err(self.error(ModuleLoadErrorKind::InvalidString));
		}
		if length == 0 {
			return Ok(None);
		}
		Ok(Some(self.read_string_payload(length as usize, pool)?))
	}

	fn read_string_payload(
		&mut self,
		length: usize,
		pool: &StringPool,
	) -> Result<IStr, ModuleLoadError> {
		let mut short_buffer = [0u16; MAX_SHORT_STRING];
		let mut long_buffer;
		let units: &mut [u16] = if length <= MAX_SHORT_STRING {
			&mut short_buffer[..length]
		} else {
			long_buffer = vec![0u16; length];
			&mut long_buffer
		};

		{
			let bytes = self.read_slice(length * 2)?;
			for (unit, pair) in units.iter_mut().zip(bytes.chunks_exact(2)) {
				*unit = u16::from_le_bytes([pair[0], pair[1]]);
			}
		}

		match String::from_utf16(units) {
			Ok(value) => Ok(pool.intern(&value)),
			Err(_) => Err(self.error(ModuleLoadErrorKind::InvalidString)),
		}
	}

	/// Reads a length-prefixed byte string (native symbol names). A length of
	/// 0 means "absent".
	pub fn read_c_string(&mut self) -> Result<Option<Vec<u8>>, ModuleLoadError> {
		let length = self.read_i32()?;
		if length < 0 {
			return Err(self.error(ModuleLoadErrorKind::InvalidString));
		}
		if length == 0 {
			return Ok(None);
		}
		Ok(Some(self.read_slice(length as usize)?.to_vec()))
	}

	/// Skips a sized collection without interpreting it.
	pub fn skip_collection(&mut self) -> Result<(), ModuleLoadError> {
		let size = self.read_u32()?;
		self.skip(size as usize)
	}

	/// Reads one sized section. A declared size of 0 means the section is
	/// entirely absent; otherwise the position after `read` must agree with
	/// the declared size.
	pub fn read_sized_section<T>(
		&mut self,
		table: &'static str,
		read: impl FnOnce(&mut Self) -> Result<T, ModuleLoadError>,
	) -> Result<Option<T>, ModuleLoadError> {
		let size = self.read_u32()?;
		if size == 0 {
			return Ok(None);
		}
		let before = self.pos;
		let value = read(self)?;
		if self.pos != before + size as usize {
			return Err(self.error(ModuleLoadErrorKind::SectionSizeMismatch(table)));
		}
		Ok(Some(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn reader(bytes: &[u8]) -> ModuleReader {
		ModuleReader::from_bytes(bytes.to_vec(), "test.ovm")
	}

	#[test]
	fn primitives_read_little_endian() {
		let mut r = reader(&[0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFF]);
		assert_eq!(r.read_u32().unwrap(), 0x0403_0201);
		assert_eq!(r.read_i32().unwrap(), -1);
		assert!(r.read_u8().is_err());
	}

	#[test]
	fn strings_are_interned() {
		let pool = StringPool::new();
		// length 2, then "ab" in UTF-16LE
		let mut r = reader(&[2, 0, 0, 0, b'a', 0, b'b', 0]);
		let s = r.read_string(&pool).unwrap();
		assert_eq!(&*s, "ab");
		assert_eq!(s, pool.intern("ab"));
	}

	#[test]
	fn sized_sections_verify_their_length() {
		// size = 4, but the payload reads only 2 bytes
		let mut r = reader(&[4, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD]);
		let result = r.read_sized_section("Test", |r| {
			r.read_u16()?;
			Ok(())
		});
		assert!(matches!(
			result.unwrap_err().kind,
			ModuleLoadErrorKind::SectionSizeMismatch("Test")
		));
	}

	#[test]
	fn empty_sections_are_skipped() {
		let mut r = reader(&[0, 0, 0, 0, 0x2A]);
		let section = r
			.read_sized_section("Test", |_| -> Result<(), ModuleLoadError> { unreachable!() })
			.unwrap();
		assert!(section.is_none());
		assert_eq!(r.read_u8().unwrap(), 0x2A);
	}
}
