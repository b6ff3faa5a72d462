pub const DEFAULT_KERNEL_CMD_LINE: &'static str =
    "ro console=ttyS0 noapic reboot=k panic=1 pci=off nomodules random.trust_cpu=on";

pub const DEFAULT_BRIDGE_NAME: &str = "firecracker0";
pub const DEFAULT_VM_CIDR: &str = "172.102.0.0/24";
pub const DEFAULT_FIRECRACKER_BINARY: &str = "/usr/bin/firecracker";
pub const DEFAULT_CLOUD_LOCALDS_BINARY: &str = "cloud-localds";
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/pyre";
pub const DEFAULT_IMAGE_DIR: &str = "/images";

pub const DEFAULT_VCPU_COUNT: u8 = 1;
pub const DEFAULT_MEMORY_MIB: u64 = 512;

pub const DEFAULT_DRAIN_WINDOW_SECS: u64 = 10;

pub const TAP_DEVICE_PREFIX: &str = "fc-tap-";

// host part 1 is the bridge gateway, so instance identities start at 2
pub const FIRST_IDENTITY: u8 = 2;
