use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn tandem_root(home: &Path) -> PathBuf {
    tandem_core::config::tandem_dir_at(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    tandem_root(home).join(DAEMON_SOCKET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_lives_under_tandem_root() {
        let home = Path::new("/home/someone");
        assert_eq!(
            socket_path(home),
            PathBuf::from("/home/someone/.tandem/daemon.sock")
        );
    }
}
