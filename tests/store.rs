#[cfg(test)]
mod tests {
    use dockman::domain::image_updates::ports::{ImageUpdate, ImageUpdateRepository};
    use dockman::domain::machines::models::{MachineRef, SaveMachineRequest};
    use dockman::domain::machines::ports::{KeyRepository, MachineRepository};
    use dockman::domain::user_config::{UserConfig, UserConfigRepository};
    use dockman::error::ErrorKind;
    use dockman::outbound::sqlite::Sqlite;
    use dockman::shared::HostName;
    use tempfile::TempDir;

    async fn open() -> (TempDir, Sqlite) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("dockman.db").display());
        (dir, Sqlite::open(&url).await.unwrap())
    }

    fn request(name: &str) -> SaveMachineRequest {
        SaveMachineRequest {
            id: None,
            name: HostName::new(name),
            enabled: true,
            host: "10.0.0.2".to_string(),
            port: 22,
            user: "root".to_string(),
            password: "hunter2".to_string(),
            use_key_pair: false,
            remote_public_key: String::new(),
        }
    }

    #[tokio::test]
    async fn test_machines_are_unique_by_name() {
        let (_dir, db) = open().await;
        let saved = db.save_machine(&request("nas")).await.unwrap();
        assert_eq!(saved.name, HostName::new("nas"));
        assert_eq!(saved.password, "hunter2");

        let err = db.save_machine(&request("nas")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let by_id = db.get_machine(&MachineRef::Id(saved.id)).await.unwrap();
        assert_eq!(by_id, saved);
    }

    #[tokio::test]
    async fn test_machine_update_and_delete() {
        let (_dir, db) = open().await;
        let saved = db.save_machine(&request("nas")).await.unwrap();

        let mut edit = SaveMachineRequest::from(&saved);
        edit.name = HostName::new("backup");
        edit.remote_public_key = "ssh-ed25519 AAAA".to_string();
        let edited = db.save_machine(&edit).await.unwrap();
        assert_eq!(edited.id, saved.id);
        assert_eq!(edited.remote_public_key, "ssh-ed25519 AAAA");

        let names: Vec<_> = db
            .list_machines()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec![HostName::new("backup")]);

        let gone = MachineRef::Name(HostName::new("nas"));
        let err = db.get_machine(&gone).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        db.delete_machine(&MachineRef::Id(saved.id)).await.unwrap();
        assert!(db.list_machines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_pairs() {
        let (_dir, db) = open().await;
        db.save_key("deploy", b"ssh-ed25519 AAAA", b"-----BEGIN-----")
            .await
            .unwrap();
        let key = db.get_key("deploy").await.unwrap();
        assert_eq!(key.public_key, b"ssh-ed25519 AAAA");
        assert_eq!(key.private_key, b"-----BEGIN-----");

        let err = db.save_key("deploy", b"x", b"y").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        db.delete_key("deploy").await.unwrap();
        assert!(db.list_keys().await.unwrap().is_empty());
        let err = db.get_key("deploy").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_image_updates_are_scoped_to_hosts() {
        let (_dir, db) = open().await;
        let local = HostName::local();
        let nas = HostName::new("nas");
        db.save_update(&ImageUpdate {
            host: local.clone(),
            image_id: "sha256:aaa".to_string(),
            update_ref: "sha256:bbb".to_string(),
        })
        .await
        .unwrap();
        db.save_update(&ImageUpdate {
            host: local.clone(),
            image_id: "sha256:aaa".to_string(),
            update_ref: "sha256:ccc".to_string(),
        })
        .await
        .unwrap();

        let ids = vec!["sha256:aaa".to_string(), "sha256:zzz".to_string()];
        let found = db.lookup_updates(&local, &ids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["sha256:aaa"].update_ref, "sha256:ccc");
        assert!(db.lookup_updates(&nas, &ids).await.unwrap().is_empty());

        db.delete_update(&local, "sha256:aaa").await.unwrap();
        assert!(db.lookup_updates(&local, &ids).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_config_defaults_then_persists() {
        let (_dir, db) = open().await;
        assert_eq!(db.get_user_config().await.unwrap(), UserConfig::default());

        let mut config = UserConfig::default();
        config.updater.enabled = true;
        config.updater.interval_secs = 600;
        config.ui.tab_limit = Some(3);
        db.save_user_config(&config).await.unwrap();
        assert_eq!(db.get_user_config().await.unwrap(), config);
    }
}
