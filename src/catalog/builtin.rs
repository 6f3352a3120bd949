//! Built-in task tables, one per platform family.

use super::{TaskCategory, TaskDescriptor};
use crate::executor::{CommandAction, DirectoryAction, FileAction, ProcessListAction, SystemSummaryAction};

/// How many crash dumps to keep.
const NEWEST_DUMPS: usize = 3;

#[cfg(windows)]
pub(super) fn descriptors() -> Vec<TaskDescriptor> {
    use crate::executor::CommandStep;
    use TaskCategory::*;

    vec![
        cim("Computer System", "Model, manufacturer and domain membership", System, "Win32_ComputerSystem"),
        cim("Operating System", "Windows edition, build and install date", System, "Win32_OperatingSystem"),
        cim("BIOS", "Firmware vendor, version and release date", Hardware, "Win32_BIOS"),
        cim("BaseBoard", "Motherboard manufacturer and product", Hardware, "Win32_BaseBoard"),
        cim("Processor", "CPU model, cores and clock speeds", Hardware, "Win32_Processor"),
        cim("Physical Memory", "Installed memory modules", Hardware, "Win32_PhysicalMemory"),
        cim("Device Memory Address", "Device memory ranges", Hardware, "Win32_DeviceMemoryAddress"),
        cim("DMA Channel", "DMA channel assignments", Hardware, "Win32_DMAChannel"),
        cim("IRQ Resource", "Interrupt assignments", Hardware, "Win32_IRQResource"),
        cim("Disk Drive", "Physical disks", Storage, "Win32_DiskDrive"),
        cim("Disk Partition", "Partitions on physical disks", Storage, "Win32_DiskPartition"),
        cim("System Devices", "Devices attached to the system", Hardware, "Win32_SystemDevices"),
        cim("Network Adapter", "Network adapters", Network, "Win32_NetworkAdapter"),
        cim("Printer", "Installed printers", Hardware, "Win32_Printer"),
        cim("Environment", "System and user environment variables", System, "Win32_Environment"),
        cim("Startup Command", "Programs run at logon", System, "Win32_StartupCommand"),
        cim("System Driver", "Kernel and file system drivers", Drivers, "Win32_SystemDriver"),
        TaskDescriptor::new(
            "DXDiag",
            "DirectX diagnostic report",
            Hardware,
            CommandAction::new(CommandStep::file("dxdiag", &["/t", "{out}", "/whql:off"], "DxDiag.txt")),
        ),
        TaskDescriptor::new(
            "SystemInfo",
            "systeminfo output",
            System,
            CommandAction::stdout("systeminfo", &[], "SystemInfo.txt"),
        ),
        cim("Drivers", "Signed PnP drivers", Drivers, "Win32_PnPSignedDriver"),
        TaskDescriptor::new(
            "Event Logs",
            "System and Application event logs",
            Logs,
            CommandAction::new(CommandStep::file("wevtutil", &["epl", "System", "{out}"], "System.evtx"))
                .then(CommandStep::file("wevtutil", &["epl", "Application", "{out}"], "Application.evtx")),
        ),
        TaskDescriptor::new(
            "IPConfig",
            "Network configuration of every adapter",
            Network,
            CommandAction::stdout("ipconfig", &["/all"], "IPConfig.txt"),
        ),
        powershell(
            "Installed Programs",
            "Programs registered for uninstall",
            Other,
            "Get-ItemProperty HKLM:\\Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\*, \
             HKLM:\\Software\\WOW6432Node\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\* \
             | Select-Object DisplayName, DisplayVersion, Publisher, InstallDate | Format-Table -AutoSize | Out-String -Width 4096",
            "InstalledPrograms.txt",
        ),
        powershell(
            "Windows Store Apps",
            "Installed Store packages",
            Other,
            "Get-AppxPackage | Select-Object Name, Version | Out-String -Width 4096",
            "StoreApps.txt",
        ),
        TaskDescriptor::new(
            "System Services",
            "Service states",
            Services,
            CommandAction::stdout("sc", &["query"], "Services.txt"),
        ),
        TaskDescriptor::new("Processes", "Running processes", System, ProcessListAction),
        TaskDescriptor::new(
            "Performance Data",
            "Available performance counters",
            System,
            CommandAction::stdout("typeperf", &["-qx"], "PerformanceCounters.txt"),
        ),
        TaskDescriptor::new(
            "HOSTS File",
            "Static host name overrides",
            Network,
            FileAction::new("C:\\Windows\\System32\\drivers\\etc\\hosts", "hosts.txt"),
        ),
        TaskDescriptor::new(
            "Dsregcmd",
            "Azure AD / domain join state",
            Network,
            CommandAction::stdout("dsregcmd", &["/status"], "Dsregcmd.txt"),
        ),
        TaskDescriptor::new(
            "Scheduled Tasks",
            "Task Scheduler entries",
            Services,
            CommandAction::stdout("schtasks", &["/query"], "ScheduledTasks.txt"),
        ),
        TaskDescriptor::new(
            "Windows Update Log",
            "Windows Update client events",
            Logs,
            CommandAction::stdout(
                "wevtutil",
                &["qe", "Microsoft-Windows-WindowsUpdateClient/Operational", "/f:text"],
                "WindowsUpdate.txt",
            ),
        ),
        TaskDescriptor::new("System Summary", "Host overview", System, SystemSummaryAction),
        TaskDescriptor::new(
            "Chkdsk",
            "Online scan of the system volume",
            Storage,
            CommandAction::stdout("chkdsk", &["C:", "/scan"], "Chkdsk.txt"),
        )
        .elevated(),
        TaskDescriptor::new(
            "DISM CheckHealth",
            "Component store health",
            System,
            CommandAction::stdout("dism", &["/online", "/cleanup-image", "/checkhealth"], "DISM.txt"),
        )
        .elevated(),
        TaskDescriptor::new(
            "Battery Report",
            "powercfg battery report",
            Hardware,
            CommandAction::new(CommandStep::file(
                "powercfg",
                &["/batteryreport", "/output", "{out}"],
                "BatteryReport.html",
            )),
        )
        .elevated(),
        TaskDescriptor::new(
            "Driver Verifier",
            "Driver verifier settings",
            Drivers,
            CommandAction::stdout("verifier", &["/querysettings"], "DriverVerifier.txt"),
        )
        .elevated(),
        TaskDescriptor::new(
            "BSOD Minidump",
            "Most recent crash minidumps",
            Logs,
            DirectoryAction::new("C:\\Windows\\Minidump", "dmp", NEWEST_DUMPS),
        )
        .elevated(),
    ]
}

#[cfg(windows)]
fn cim(name: &str, description: &str, category: TaskCategory, class: &str) -> TaskDescriptor {
    let script = format!("Get-CimInstance -ClassName {} | Format-List * | Out-String -Width 4096", class);
    let artifact = format!("{}.txt", class.trim_start_matches("Win32_"));
    TaskDescriptor::new(
        name,
        description,
        category,
        CommandAction::stdout(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", &script],
            &artifact,
        ),
    )
}

#[cfg(windows)]
fn powershell(name: &str, description: &str, category: TaskCategory, script: &str, artifact: &str) -> TaskDescriptor {
    TaskDescriptor::new(
        name,
        description,
        category,
        CommandAction::stdout(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", script],
            artifact,
        ),
    )
}

/// First package manager found wins.
#[cfg(not(windows))]
const LIST_PACKAGES: &str = "if command -v dpkg-query >/dev/null 2>&1; then dpkg-query -W; \
elif command -v rpm >/dev/null 2>&1; then rpm -qa; \
elif command -v pacman >/dev/null 2>&1; then pacman -Q; \
elif command -v apk >/dev/null 2>&1; then apk info -v; \
else echo 'no supported package manager found' >&2; exit 1; fi";

#[cfg(not(windows))]
pub(super) fn descriptors() -> Vec<TaskDescriptor> {
    use TaskCategory::*;

    vec![
        TaskDescriptor::new(
            "Kernel",
            "Kernel name, release and architecture",
            System,
            CommandAction::stdout("uname", &["-a"], "uname.txt"),
        ),
        TaskDescriptor::new(
            "Operating System",
            "Distribution release information",
            System,
            FileAction::new("/etc/os-release", "os-release.txt"),
        ),
        TaskDescriptor::new("System Summary", "Host overview", System, SystemSummaryAction),
        TaskDescriptor::new(
            "Uptime",
            "Uptime and load averages",
            System,
            CommandAction::stdout("uptime", &[], "uptime.txt"),
        ),
        TaskDescriptor::new(
            "Processor",
            "CPU model, topology and flags",
            Hardware,
            CommandAction::stdout("lscpu", &[], "lscpu.txt"),
        ),
        TaskDescriptor::new(
            "Physical Memory",
            "Kernel memory statistics",
            Hardware,
            FileAction::new("/proc/meminfo", "meminfo.txt"),
        ),
        TaskDescriptor::new(
            "PCI Devices",
            "Devices on the PCI bus",
            Hardware,
            CommandAction::stdout("lspci", &["-nn"], "lspci.txt"),
        ),
        TaskDescriptor::new(
            "USB Devices",
            "Devices on the USB bus",
            Hardware,
            CommandAction::stdout("lsusb", &[], "lsusb.txt"),
        ),
        TaskDescriptor::new(
            "Network Adapter",
            "Interfaces and addresses",
            Network,
            CommandAction::stdout("ip", &["addr", "show"], "ip-addr.txt"),
        ),
        TaskDescriptor::new(
            "Routes",
            "Routing table",
            Network,
            CommandAction::stdout("ip", &["route", "show"], "ip-route.txt"),
        ),
        TaskDescriptor::new(
            "Listening Sockets",
            "TCP and UDP listeners",
            Network,
            CommandAction::stdout("ss", &["-tuln"], "sockets.txt"),
        ),
        TaskDescriptor::new(
            "HOSTS File",
            "Static host name overrides",
            Network,
            FileAction::new("/etc/hosts", "hosts.txt"),
        ),
        TaskDescriptor::new(
            "Block Devices",
            "Disks and partitions",
            Storage,
            CommandAction::stdout("lsblk", &["-o", "NAME,SIZE,TYPE,FSTYPE,MOUNTPOINT,MODEL"], "lsblk.txt"),
        ),
        TaskDescriptor::new(
            "Disk Usage",
            "Mounted file systems and free space",
            Storage,
            CommandAction::stdout("df", &["-h"], "df.txt"),
        ),
        TaskDescriptor::new(
            "System Services",
            "Loaded systemd units",
            Services,
            CommandAction::stdout("systemctl", &["list-units", "--all", "--no-pager"], "units.txt"),
        ),
        TaskDescriptor::new("Processes", "Running processes", System, ProcessListAction),
        TaskDescriptor::new(
            "Scheduled Tasks",
            "systemd timers",
            Services,
            CommandAction::stdout("systemctl", &["list-timers", "--all", "--no-pager"], "timers.txt"),
        ),
        TaskDescriptor::new(
            "Event Logs",
            "Journal of the current boot",
            Logs,
            CommandAction::stdout("journalctl", &["-b", "--no-pager", "-n", "5000"], "journal.txt"),
        ),
        TaskDescriptor::new(
            "Drivers",
            "Loaded kernel modules",
            Drivers,
            CommandAction::stdout("lsmod", &[], "lsmod.txt"),
        ),
        TaskDescriptor::new(
            "Installed Packages",
            "Packages known to the system package manager",
            Other,
            CommandAction::stdout("sh", &["-c", LIST_PACKAGES], "packages.txt"),
        ),
        TaskDescriptor::new(
            "Kernel Ring Buffer",
            "Kernel messages",
            Logs,
            CommandAction::stdout("dmesg", &[], "dmesg.txt"),
        )
        .elevated(),
        TaskDescriptor::new(
            "Partition Tables",
            "Partition layout of every disk",
            Storage,
            CommandAction::stdout("fdisk", &["-l"], "fdisk.txt"),
        )
        .elevated(),
        TaskDescriptor::new(
            "Crash Dumps",
            "Most recent crash reports",
            Logs,
            DirectoryAction::new("/var/crash", "crash", NEWEST_DUMPS),
        )
        .elevated(),
    ]
}
