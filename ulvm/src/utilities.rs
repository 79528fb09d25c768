use std::io::{Cursor, Read};
use std::mem::size_of;

/// Reads a value out of a byte cursor, given whatever side-table (`Deps`) the
/// value's own decoding needs (an index-size table, a heap, ...). Every wire
/// structure in [`crate::format`] implements this instead of hand-rolling a
/// `read(&mut Cursor<..>)` free function per type.
pub trait FromByteStream
where
	Self: Sized,
{
	type Deps;
	fn read(stream: &mut Cursor<&[u8]>, deps: &Self::Deps) -> std::io::Result<Self>;
}

/// Implements [`FromByteStream`] for a `#[repr(C)]` struct whose fields are
/// all big-endian on disk, by reading each field in turn and swapping bytes
/// as needed. The image format is specified as big-endian throughout (see
/// `format::Header`), so unlike a little-endian wire format we cannot read
/// the struct as raw bytes and hand it back: every multi-byte field needs an
/// explicit `from_be_bytes` swap. `$($field: $ty),*` must list every field of
/// the struct, in declaration order.
macro_rules! impl_from_be_byte_stream {
	($ty: ty { $($field: ident: $fty: ty),* $(,)? }) => {
		impl crate::utilities::FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut std::io::Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				Ok(Self {
					$($field: <$fty as crate::utilities::FromByteStream>::read(stream, &())?),*
				})
			}
		}
	};
}

pub(crate) use impl_from_be_byte_stream;

impl FromByteStream for u8 {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let mut byte = 0u8;
		stream.read_exact(std::slice::from_mut(&mut byte))?;
		Ok(byte)
	}
}

impl FromByteStream for i8 {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, deps: &Self::Deps) -> std::io::Result<Self> {
		Ok(u8::read(stream, deps)? as i8)
	}
}

macro_rules! impl_from_be_byte_stream_num {
	($($ty: ty),*) => {$(
		impl crate::utilities::FromByteStream for $ty {
			type Deps = ();
			#[inline]
			fn read(stream: &mut std::io::Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
				let mut bytes = [0u8; size_of::<Self>()];
				stream.read_exact(&mut bytes)?;
				Ok(Self::from_be_bytes(bytes))
			}
		}
	)*};
}

impl_from_be_byte_stream_num!(u16, u32, u64, i16, i32, i64, f32, f64);

impl<T: FromByteStream<Deps = ()> + Copy + Default, const SIZE: usize> FromByteStream for [T; SIZE] {
	type Deps = ();
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let mut values = [T::default(); SIZE];
		for slot in values.iter_mut() {
			*slot = T::read(stream, &())?;
		}
		Ok(values)
	}
}

/// Rounds `value` up to the next multiple of `MULTIPLE`. Every section of a
/// loadable image is aligned to 8 bytes; this is also how the decoder derives
/// each section's starting offset from the previous section's raw size.
#[inline]
pub(crate) const fn round_to_multiple_of<const MULTIPLE: usize>(value: usize) -> usize {
	((value + (MULTIPLE - 1)) / MULTIPLE) * MULTIPLE
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_to_multiple_of_rounds_up() {
		assert_eq!(round_to_multiple_of::<8>(0), 0);
		assert_eq!(round_to_multiple_of::<8>(1), 8);
		assert_eq!(round_to_multiple_of::<8>(8), 8);
		assert_eq!(round_to_multiple_of::<8>(9), 16);
	}

	#[test]
	fn reads_big_endian_integers() {
		let bytes: &[u8] = &[0x00, 0x00, 0x01, 0x02];
		let mut cursor = Cursor::new(bytes);
		let value = u32::read(&mut cursor, &()).unwrap();
		assert_eq!(value, 0x0102);
	}
}
