use assert_cmd::Command;

pub fn hydra_sync_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("hydra-sync").expect("hydra-sync test binary should build")
    }
}
