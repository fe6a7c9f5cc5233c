//! Best-effort utun interface-name discovery
//!
//! On Apple platforms the packet-tunnel provider owns the utun file
//! descriptor and never tells us its name. As a last resort we scan the
//! process's descriptors for the `AF_SYSTEM` control socket belonging to
//! `com.apple.net.utun_control` and read the interface name through a socket
//! option. Elsewhere (and on any failure) this returns `None`.

/// Scan fds 0..1024 for the utun control socket and return its name
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn discover_interface_name() -> Option<String> {
    use libc::{
        ctl_info, getpeername, getsockopt, ioctl, sockaddr_ctl, socklen_t, AF_SYSTEM, CTLIOCGINFO,
        IF_NAMESIZE, SYSPROTO_CONTROL, UTUN_OPT_IFNAME,
    };
    use std::mem::size_of;

    const CTL_NAME: &[u8] = b"com.apple.net.utun_control";

    let mut info = ctl_info {
        ctl_id: 0,
        ctl_name: [0; 96],
    };
    for (dst, src) in info.ctl_name.iter_mut().zip(CTL_NAME) {
        *dst = *src as libc::c_char;
    }

    for fd in 0..1024 {
        let mut addr = sockaddr_ctl {
            sc_len: size_of::<sockaddr_ctl>() as u8,
            sc_family: 0,
            ss_sysaddr: 0,
            sc_id: info.ctl_id,
            sc_unit: 0,
            sc_reserved: Default::default(),
        };

        let mut len = size_of::<sockaddr_ctl>() as socklen_t;
        let ret = unsafe { getpeername(fd, &mut addr as *mut sockaddr_ctl as _, &mut len) };
        if ret != 0 || addr.sc_family != AF_SYSTEM as u8 {
            continue;
        }

        // Resolve the control id for the utun control name once
        if info.ctl_id == 0 {
            let ret = unsafe { ioctl(fd, CTLIOCGINFO, &mut info as *mut ctl_info) };
            if ret != 0 {
                continue;
            }
        }

        if addr.sc_id != info.ctl_id {
            continue;
        }

        let mut name = [0u8; IF_NAMESIZE];
        let mut name_len = name.len() as socklen_t;
        let ret = unsafe {
            getsockopt(
                fd,
                SYSPROTO_CONTROL,
                UTUN_OPT_IFNAME,
                name.as_mut_ptr() as _,
                &mut name_len,
            )
        };
        if ret != 0 || name_len == 0 {
            continue;
        }

        return Some(String::from_utf8_lossy(&name[..(name_len - 1) as usize]).to_string());
    }

    None
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub fn discover_interface_name() -> Option<String> {
    None
}
