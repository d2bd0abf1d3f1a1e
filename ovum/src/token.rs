use std::fmt::{Debug, Formatter};

use paste::paste;

macro_rules! define_token {
	($($id: ident = $discriminant: literal),*) => {
		#[repr(u32)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
		pub enum TokenKind {
			$($id = $discriminant),*
		}

		/// A tagged index into one of a module's member tables. The kind lives
		/// in the high byte, the low 24 bits are a 1-based table index. The
		/// raw value 0 is reserved for "none" and is not a valid `Token`.
		#[repr(transparent)]
		#[derive(Copy, Clone, Eq, PartialEq, Hash)]
		pub struct Token(u32);

		impl Token {
			pub fn new(kind: TokenKind, index: usize) -> Self {
				Self((kind as u32) << 24 | index as u32 & 0x00FF_FFFF)
			}

			pub fn kind(&self) -> TokenKind {
				let discriminant = (self.0 & 0xFF00_0000) >> 24;
				match discriminant {
					$($discriminant => TokenKind::$id,)*
					_ => unreachable!(),
				}
			}

			/// The 1-based index stored in the low bits.
			#[inline]
			pub fn index(&self) -> usize {
				(self.0 & 0x00FF_FFFF) as usize
			}

			#[inline]
			pub fn raw(&self) -> u32 {
				self.0
			}
		}

		impl TryFrom<u32> for Token {
			type Error = ();
			fn try_from(value: u32) -> Result<Self, Self::Error> {
				let discriminant = (value & 0xFF00_0000) >> 24;
				if value & 0x00FF_FFFF == 0 {
					return Err(());
				}
				match discriminant {
					$($discriminant => Ok(Self(value)),)*
					_ => Err(())
				}
			}
		}

		paste! {
			$(
				#[repr(transparent)]
				#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
				pub struct [<$id Token>](pub usize);

				impl From<[<$id Token>]> for Token {
					fn from(value: [<$id Token>]) -> Self {
						Token(((TokenKind::$id as u32) << 24) | value.0 as u32)
					}
				}

				impl TryFrom<Token> for [<$id Token>] {
					type Error = ();
					fn try_from(value: Token) -> Result<Self, Self::Error> {
						match value.kind() {
							TokenKind::$id => Ok(Self(value.index())),
							_ => Err(()),
						}
					}
				}
			)*
		}
	};
}

define_token! {
	ModuleRef = 0x01,
	TypeDef = 0x02,
	TypeRef = 0x04,
	FieldDef = 0x06,
	FieldRef = 0x08,
	MethodDef = 0x0A,
	MethodRef = 0x0C,
	FunctionDef = 0x10,
	FunctionRef = 0x12,
	String = 0x20,
	ConstantDef = 0x40
}

impl Debug for Token {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "Token::{:?}(", self.kind())?;
		self.index().fmt(f)?;
		write!(f, ")")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kind_and_index_round_trip() {
		let token = Token::new(TokenKind::MethodDef, 42);
		assert_eq!(token.kind(), TokenKind::MethodDef);
		assert_eq!(token.index(), 42);
		assert_eq!(token.raw(), 0x0A00_002A);
	}

	#[test]
	fn invalid_kinds_are_rejected() {
		assert!(Token::try_from(0x0300_0001).is_err());
		assert!(Token::try_from(0xFF00_0001).is_err());
	}

	#[test]
	fn zero_index_is_not_a_token() {
		assert!(Token::try_from(0x0200_0000).is_err());
		assert!(Token::try_from(0).is_err());
	}

	#[test]
	fn typed_wrappers_check_the_kind() {
		let token = Token::new(TokenKind::String, 3);
		assert_eq!(StringToken::try_from(token), Ok(StringToken(3)));
		assert!(TypeDefToken::try_from(token).is_err());
		assert_eq!(Token::from(StringToken(3)), token);
	}
}
