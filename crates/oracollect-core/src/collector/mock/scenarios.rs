//! Ready-made `/proc` fixtures for discovery and self-monitoring tests.

use super::filesystem::MockFs;

const SELF_STATUS: &str = "\
Name:\toracollectd
State:\tS (sleeping)
Pid:\t4242
VmSize:\t  812340 kB
VmRSS:\t   24576 kB
Threads:\t9
";

impl MockFs {
    /// A database host running one PMON (and SMON) process per `(sid, pid)`
    /// next to a few unrelated processes.
    pub fn oracle_host(instances: &[(&str, u32)]) -> Self {
        let mut fs = Self::new();
        fs.add_process(1, &["/sbin/init", "splash"]);
        fs.add_process(812, &["/u01/app/oracle/product/19c/bin/tnslsnr", "LISTENER", "-inherit"]);
        fs.add_process(2201, &["-bash"]);
        for (sid, pid) in instances {
            fs.add_process(*pid, &[format!("ora_pmon_{sid}").as_str()]);
            fs.add_process(pid + 1, &[format!("ora_smon_{sid}").as_str()]);
        }
        fs.add_file("/proc/self/status", SELF_STATUS);
        fs
    }

    /// Host with a single standalone instance `ORCL1`.
    pub fn single_instance() -> Self {
        Self::oracle_host(&[("ORCL1", 3100)])
    }

    /// One node of a cluster running two databases.
    pub fn cluster_node() -> Self {
        let mut fs = Self::oracle_host(&[("PROD1", 4100), ("DWH1", 4200)]);
        fs.add_process(4000, &["asm_pmon_+ASM1"]);
        fs
    }
}
