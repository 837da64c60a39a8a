//! `open` flags and `lseek` whence values (`SPEC_FULL.md` §6.3).

use bitflags::bitflags;

bitflags! {
    pub struct OpenFlags: i32 {
        const RDONLY = 0;
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const ACCMODE = 0o3;
        const CREAT = 0o100;
        const EXCL = 0o200;
        const NOCTTY = 0o400;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NONBLOCK = 0o4000;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.bits() & Self::ACCMODE.bits() != Self::WRONLY.bits()
    }

    pub fn writable(self) -> bool {
        let acc = self.bits() & Self::ACCMODE.bits();
        acc == Self::WRONLY.bits() || acc == Self::RDWR.bits()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_i32(n: i32) -> Option<Self> {
        match n {
            1 => Some(Whence::Set),
            2 => Some(Whence::Cur),
            3 => Some(Whence::End),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdonly_is_readable_but_not_writable() {
        assert!(OpenFlags::RDONLY.readable());
        assert!(!OpenFlags::RDONLY.writable());
    }

    #[test]
    fn rdwr_is_both() {
        assert!(OpenFlags::RDWR.readable());
        assert!(OpenFlags::RDWR.writable());
    }

    #[test]
    fn wronly_is_writable_but_not_readable() {
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::WRONLY.writable());
    }

    #[test]
    fn whence_rejects_an_unknown_value() {
        assert_eq!(Whence::from_i32(0), None);
        assert_eq!(Whence::from_i32(1), Some(Whence::Set));
    }
}
