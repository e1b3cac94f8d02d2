//! User-pointer validation
//!
//! Range checks only: the actual copies go through the address-space
//! translations in `mm::uaccess`, which turn genuinely bad pointers into
//! `EFAULT` when no mapping covers them.

use crate::{error::Errno, mm};

/// Reject null, kernel-half, and wrapping user ranges.
pub fn validate_user_range(addr: u64, len: usize) -> Result<(), Errno> {
    if addr == 0 {
        return Err(Errno::Efault);
    }

    let end = addr.checked_add(len as u64).ok_or(Errno::Efault)?;
    if end > mm::USER_END + 1 {
        return Err(Errno::Efault);
    }

    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_and_kernel_pointers() {
        assert_eq!(validate_user_range(0, 8), Err(Errno::Efault));
        assert_eq!(
            validate_user_range(0xFFFF_8000_0000_0000, 8),
            Err(Errno::Efault)
        );
        assert_eq!(validate_user_range(u64::MAX, 16), Err(Errno::Efault));
    }

    #[test]
    fn accepts_user_ranges() {
        assert!(validate_user_range(0x1000, 4096).is_ok());
        assert!(validate_user_range(crate::mm::USER_END - 7, 8).is_ok());
    }
}
