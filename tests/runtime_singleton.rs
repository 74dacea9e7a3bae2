use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use reportforge::runtime::{
    AppInstance, ExecutionMode, RuntimeOverrides, app_instance_with, construction_count,
};
use tempfile::tempdir;

#[test]
fn concurrent_first_access_constructs_one_instance() {
    let temp = tempdir().unwrap();
    let overrides = RuntimeOverrides {
        home: Some(temp.path().join("home")),
        resource_root: Some(temp.path().to_path_buf()),
        engine: Some(PathBuf::from("/bin/true")),
        exe_dir: Some(temp.path().to_path_buf()),
        ..RuntimeOverrides::default()
    };

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let barrier = barrier.clone();
            let overrides = overrides.clone();
            thread::spawn(move || {
                barrier.wait();
                app_instance_with(&overrides).unwrap() as *const AppInstance as usize
            })
        })
        .collect();
    let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(construction_count(), 1);

    let app = app_instance_with(&RuntimeOverrides::default()).unwrap();
    assert_eq!(app as *const AppInstance as usize, addresses[0]);
    assert_eq!(construction_count(), 1);
    assert_eq!(app.context().execution_mode, ExecutionMode::Normal);
    assert!(app.context().config_path.is_file());
    assert_eq!(app.engine().program, PathBuf::from("/bin/true"));
}
