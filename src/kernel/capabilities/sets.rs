//! Raw capability set access. All operations are idempotent.
use super::{CapabilityMask, CapabilityNumber, LINUX_CAPABILITY_VERSION_3, PR_SET_KEEPCAPS};
use crate::config::types::{DaemonError, Result};

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// (effective, permitted) of the calling thread.
fn read_sets() -> Result<(CapabilityMask, CapabilityMask)> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    // SAFETY: capget(2) with a v3 header (pid 0 = self) and two data slots,
    // which is exactly what the v3 ABI writes.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::Privilege(format!("capget failed: {}", err)));
    }

    let join = |lo: u32, hi: u32| CapabilityMask::from_bits(((hi as u64) << 32) | lo as u64);
    Ok((
        join(data[0].effective, data[1].effective),
        join(data[0].permitted, data[1].permitted),
    ))
}

fn write_sets(effective: CapabilityMask, permitted: CapabilityMask) -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let split = |mask: CapabilityMask| (mask.bits() as u32, (mask.bits() >> 32) as u32);
    let (eff_lo, eff_hi) = split(effective);
    let (prm_lo, prm_hi) = split(permitted);
    let data = [
        CapUserData {
            effective: eff_lo,
            permitted: prm_lo,
            inheritable: 0,
        },
        CapUserData {
            effective: eff_hi,
            permitted: prm_hi,
            inheritable: 0,
        },
    ];

    // SAFETY: capset(2) with a valid v3 header and two initialized data entries.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::Privilege(format!("capset failed: {}", err)));
    }
    Ok(())
}

pub fn effective_capabilities() -> Result<CapabilityMask> {
    read_sets().map(|(effective, _)| effective)
}

/// Reduce permitted and effective sets to `cap` alone (if it is permitted at all).
///
/// Calling this again after a uid change re-raises `cap` into the effective
/// set, since the kernel clears the effective set on that transition.
pub fn restrict_to(cap: CapabilityNumber) -> Result<()> {
    let (_, permitted) = read_sets()?;
    let keep = if permitted.contains(cap) {
        CapabilityMask::only(cap)
    } else {
        CapabilityMask::EMPTY
    };
    write_sets(keep, keep)?;
    log::debug!(
        "Restricted capability sets to {:#x} (permitted was {:#x})",
        keep.bits(),
        permitted.bits()
    );
    Ok(())
}

/// Zero effective, permitted and inheritable sets. One-way.
pub fn drop_all_capabilities() -> Result<()> {
    match write_sets(CapabilityMask::EMPTY, CapabilityMask::EMPTY) {
        Ok(()) => {
            log::info!("Zeroed all capability sets via capset(2)");
            Ok(())
        }
        Err(e) => {
            // Clearing sets can only fail if we hold nothing worth clearing.
            match read_sets() {
                Ok((effective, permitted)) if effective.is_empty() && permitted.is_empty() => Ok(()),
                _ => Err(e),
            }
        }
    }
}

/// Keep permitted capabilities across the next setresuid away from root.
pub fn set_keep_caps(keep: bool) -> Result<()> {
    // SAFETY: prctl(PR_SET_KEEPCAPS, 0|1) has no memory side effects.
    let rc = unsafe { libc::prctl(PR_SET_KEEPCAPS, keep as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(DaemonError::Privilege(format!(
            "prctl(PR_SET_KEEPCAPS, {}) failed: {}",
            keep, err
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_sets_are_readable() {
        assert!(read_sets().is_ok());
    }

    #[test]
    fn restrict_is_idempotent() {
        let first = restrict_to(CapabilityNumber::SYS_NICE).map(|_| effective_capabilities());
        let second = restrict_to(CapabilityNumber::SYS_NICE).map(|_| effective_capabilities());
        assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(Ok(a)), Ok(Ok(b))) = (first, second) {
            assert_eq!(a, b);
            assert!(a.count() <= 1);
        }
    }

    #[test]
    fn keep_caps_toggle_is_harmless() {
        assert!(set_keep_caps(false).is_ok());
    }
}
