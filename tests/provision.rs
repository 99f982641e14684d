use std::path::Path;

use vbox_provision_lib::{
    config::{ImageStrategy, NetworkMatch, NicConfig, NicMode, ProvisionConfig},
    vbox::{
        mock::{Call, MockVirtualBox},
        models::{Machine, MachineState, NicAttachment, NicHardware, NicNetwork},
    },
    vm::Provisioner,
    Error,
};

fn nic(index: u8, mode: NicMode) -> NicConfig {
    NicConfig {
        index,
        mode,
        hardware: NicHardware::default(),
    }
}

fn creation_ops(vbox: &MockVirtualBox) -> Vec<&'static str> {
    vbox.mutations().iter().map(Call::op).collect()
}

#[tokio::test]
async fn new_machine_is_created_with_one_controller_and_one_disk() {
    let vbox = MockVirtualBox::new();
    let provisioner = Provisioner::new(&vbox, ProvisionConfig::default());

    let machine = provisioner
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap();

    assert_eq!(machine.name, "web01");
    assert_eq!(machine.storage_controllers, vec!["storctrl0".to_string()]);
    assert_eq!(machine.nics.get(&1), Some(&NicAttachment::Hostonly));

    assert_eq!(vbox.count("create_machine"), 1);
    assert_eq!(vbox.count("add_storage_controller"), 1);
    assert_eq!(vbox.count("attach_storage"), 1);

    let calls = vbox.calls();
    assert_eq!(calls[0], Call::GetMachine("web01".into()));
    assert_eq!(calls[1], Call::CreateMachine("web01".into()));
    assert!(matches!(&calls[2], Call::AddStorageController(name, ctl) if name == "web01" && ctl.name == "storctrl0"));
    assert!(matches!(&calls[3], Call::CloneMedium(src, _) if src == Path::new("/images/base.vdi")));

    let attached = calls
        .iter()
        .find_map(|c| match c {
            Call::AttachStorage(_, controller, medium) => Some((controller.clone(), medium.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(attached.0, "storctrl0");
    assert_eq!(attached.1.medium.parent(), Some(Path::new("/images")));
    let file = attached.1.medium.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file.contains("base.vdi"), "{file}");
    assert!(file.starts_with(".web01."), "{file}");
}

#[tokio::test]
async fn existing_machine_is_returned_untouched() {
    let mut existing = Machine::new("web01");
    existing.uuid = "existing".into();
    existing.state = MachineState::Saved;
    let vbox = MockVirtualBox::new().with_machine(existing.clone());

    let machine = Provisioner::new(&vbox, ProvisionConfig::default())
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap();

    assert_eq!(machine, existing);
    assert!(vbox.mutations().is_empty());
    assert_eq!(vbox.calls(), vec![Call::GetMachine("web01".into())]);
}

#[tokio::test]
async fn direct_strategy_attaches_source_path() {
    let vbox = MockVirtualBox::new();
    let config = ProvisionConfig {
        image_strategy: ImageStrategy::Direct,
        nics: vec![nic(1, NicMode::Nat)],
        ..ProvisionConfig::default()
    };

    Provisioner::new(&vbox, config)
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap();

    assert_eq!(vbox.count("clone_medium"), 0);
    let medium = vbox
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::AttachStorage(_, _, medium) => Some(medium),
            _ => None,
        })
        .unwrap();
    assert_eq!(medium.medium, Path::new("/images/base.vdi"));
}

#[tokio::test]
async fn link_strategy_hard_links_next_to_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("base.vdi");
    std::fs::write(&source, b"disk").unwrap();

    let vbox = MockVirtualBox::new();
    let config = ProvisionConfig {
        image_strategy: ImageStrategy::Link,
        nics: vec![nic(1, NicMode::Nat)],
        ..ProvisionConfig::default()
    };

    Provisioner::new(&vbox, config)
        .provision("web01", &source)
        .await
        .unwrap();

    let medium = vbox
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::AttachStorage(_, _, medium) => Some(medium.medium),
            _ => None,
        })
        .unwrap();
    assert_ne!(medium, source);
    assert_eq!(medium.parent(), Some(dir.path()));
    assert_eq!(std::fs::read(&medium).unwrap(), b"disk");
    assert!(source.exists());
    assert_eq!(vbox.count("clone_medium"), 0);
}

#[tokio::test]
async fn nat_and_hostonly_nics_follow_the_plan() {
    let vbox = MockVirtualBox::new();
    let config = ProvisionConfig {
        image_strategy: ImageStrategy::Direct,
        nics: vec![nic(2, NicMode::Hostonly), nic(1, NicMode::Nat)],
        port_forwards: vec!["ssh:tcp:2222:22".parse().unwrap()],
        ..ProvisionConfig::default()
    };

    let machine = Provisioner::new(&vbox, config)
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap();

    assert_eq!(machine.nics.get(&1), Some(&NicAttachment::Nat));
    assert_eq!(machine.nics.get(&2), Some(&NicAttachment::Hostonly));

    let nics: Vec<(u8, NicNetwork)> = vbox
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::SetNic(_, index, nic) => Some((index, nic.network)),
            _ => None,
        })
        .collect();
    assert_eq!(
        nics,
        vec![
            (1, NicNetwork::Nat),
            (2, NicNetwork::Hostonly("vboxnet0".into())),
        ]
    );

    let forwards: Vec<Call> = vbox
        .calls()
        .into_iter()
        .filter(|c| c.op() == "add_nat_port_forward")
        .collect();
    assert_eq!(forwards.len(), 1);
    assert!(matches!(&forwards[0], Call::AddNatPortForward(_, 1, rule) if rule.guest_port == 22));

    assert_eq!(vbox.count("create_hostonly_network"), 1);
    assert_eq!(vbox.count("add_dhcp_server"), 1);
}

#[tokio::test]
async fn two_hostonly_nics_share_one_reconciliation() {
    let vbox = MockVirtualBox::new();
    let config = ProvisionConfig {
        image_strategy: ImageStrategy::Direct,
        nics: vec![nic(1, NicMode::Hostonly), nic(2, NicMode::Hostonly)],
        network_match: NetworkMatch::Subnet,
        ..ProvisionConfig::default()
    };

    Provisioner::new(&vbox, config)
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap();

    assert_eq!(vbox.count("hostonly_networks"), 1);
    assert_eq!(vbox.count("set_nic"), 2);
}

#[tokio::test]
async fn first_failure_aborts_without_rollback() {
    let vbox = MockVirtualBox::new().fail_on("attach_storage");

    let err = Provisioner::new(&vbox, ProvisionConfig::default())
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Command { ref stderr, .. } if stderr.contains("attach_storage")));
    assert_eq!(
        creation_ops(&vbox),
        vec![
            "create_machine",
            "add_storage_controller",
            "clone_medium",
            "attach_storage"
        ]
    );
    // Left behind as created.
    assert!(vbox.machine("web01").is_some());
}

#[tokio::test]
async fn lookup_errors_other_than_not_found_are_fatal() {
    let vbox = MockVirtualBox::new().fail_on("get_machine");

    let err = Provisioner::new(&vbox, ProvisionConfig::default())
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Command { .. }));
    assert!(vbox.mutations().is_empty());
}

#[tokio::test]
async fn invalid_plan_makes_no_calls() {
    let vbox = MockVirtualBox::new();
    let config = ProvisionConfig {
        nics: vec![nic(1, NicMode::Nat), nic(1, NicMode::Hostonly)],
        ..ProvisionConfig::default()
    };

    let err = Provisioner::new(&vbox, config)
        .provision("web01", Path::new("/images/base.vdi"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(vbox.calls().is_empty());
}
