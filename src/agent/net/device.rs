use anyhow::{Result, bail};
use futures_util::TryStreamExt;
use nix::libc;
use rtnetlink::new_connection;
use tokio::spawn;

const SIOCBRADDIF: libc::Ioctl = 0x89a2;

// IFNAMSIZ includes the trailing NUL, so 15 bytes of name is the kernel limit
fn str_to_const_ifname(name: &str) -> Result<[libc::c_char; libc::IFNAMSIZ]> {
    if name.len() >= libc::IFNAMSIZ {
        bail!("device name {name} is longer than IFNAMSIZ");
    }

    let mut ifname: [libc::c_char; libc::IFNAMSIZ] = [0; libc::IFNAMSIZ];
    for (i, c) in name.as_bytes().iter().enumerate() {
        ifname[i] = *c as libc::c_char;
    }
    Ok(ifname)
}

pub async fn exists(name: &str) -> Result<bool> {
    let (connection, handle, _) = new_connection()?;
    spawn(connection);

    let mut link = handle.link().get().match_name(name.to_string()).execute();

    match link.try_next().await {
        Ok(Some(_)) => Ok(true),
        _ => Ok(false),
    }
}

pub async fn index(name: &str) -> Result<u32> {
    let (connection, handle, _) = new_connection()?;
    spawn(connection);

    let mut link = handle.link().get().match_name(name.to_string()).execute();

    let Some(link) = link.try_next().await? else {
        bail!("device {name} not found");
    };

    Ok(link.header.index)
}

pub async fn delete(name: &str) -> Result<()> {
    let (connection, handle, _) = new_connection()?;
    spawn(connection);

    let mut link = handle.link().get().match_name(name.to_string()).execute();

    let Some(link) = link.try_next().await? else {
        bail!("device {name} not found");
    };

    handle.link().del(link.header.index).execute().await?;

    Ok(())
}

/// Creates a persistent tap device. The device is left down; bringing the
/// link up is a separate provisioning step.
pub fn tap_create(name: &str) -> Result<()> {
    let ifr_name = str_to_const_ifname(name)?;
    let mut req = libc::ifreq {
        ifr_name,
        ifr_ifru: libc::__c_anonymous_ifr_ifru {
            ifru_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as i16,
        },
    };

    let fd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if fd == -1 {
        bail!(
            "failed to open /dev/net/tun: {}",
            std::io::Error::last_os_error()
        );
    }

    if unsafe { libc::ioctl(fd, libc::TUNSETIFF, std::ptr::addr_of_mut!(req)) } != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("failed to set interface name: {}", err);
    };

    if unsafe { libc::ioctl(fd, libc::TUNSETPERSIST, 1) } != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("failed to set persist: {}", err);
    }

    unsafe { libc::close(fd) };

    Ok(())
}

pub async fn bridge_attach(name: &str, bridge_name: &str) -> Result<()> {
    let bridge_ifname = str_to_const_ifname(bridge_name)?;
    let index = index(name).await?;

    let ctrl_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if ctrl_fd < 0 {
        bail!(
            "failed to create socket: {}",
            std::io::Error::last_os_error()
        );
    };

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    req.ifr_name = bridge_ifname;
    req.ifr_ifru.ifru_ifindex = index as i32;

    if unsafe { libc::ioctl(ctrl_fd, SIOCBRADDIF, std::ptr::addr_of_mut!(req)) } != 0 {
        unsafe { libc::close(ctrl_fd) };
        bail!("failed to set master: {}", std::io::Error::last_os_error());
    }

    unsafe { libc::close(ctrl_fd) };

    Ok(())
}

pub fn link_up(name: &str) -> Result<()> {
    let ifr_name = str_to_const_ifname(name)?;

    let ctrl_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if ctrl_fd < 0 {
        bail!(
            "failed to create socket: {}",
            std::io::Error::last_os_error()
        );
    };

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    req.ifr_name = ifr_name;

    if unsafe { libc::ioctl(ctrl_fd, libc::SIOCGIFFLAGS, std::ptr::addr_of_mut!(req)) } != 0 {
        unsafe { libc::close(ctrl_fd) };
        bail!(
            "failed to get interface flags: {}",
            std::io::Error::last_os_error()
        );
    }

    unsafe { req.ifr_ifru.ifru_flags |= libc::IFF_UP as i16 };

    if unsafe { libc::ioctl(ctrl_fd, libc::SIOCSIFFLAGS, std::ptr::addr_of_mut!(req)) } != 0 {
        unsafe { libc::close(ctrl_fd) };
        bail!(
            "failed to set interface up: {}",
            std::io::Error::last_os_error()
        );
    }

    unsafe { libc::close(ctrl_fd) };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlong_device_names_are_rejected() {
        let name = "pyre-device-name-too-long";
        assert!(str_to_const_ifname(name).is_err());
        assert!(tap_create(name).is_err());
        assert!(link_up(name).is_err());
    }

    #[test]
    fn test_device_name_length_limit_is_ifnamsiz() {
        assert!(str_to_const_ifname("abcdefghijklmno").is_ok());
        assert!(str_to_const_ifname("abcdefghijklmnop").is_err());
    }

    #[tokio::test]
    async fn test_bridge_attach_rejects_overlong_bridge_name() {
        let err = bridge_attach("fc-tap-0", "pyre-bridge-name-too-long")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("IFNAMSIZ"));
    }
}
