//! Environment and mount points handed to task containers

use crate::task::description::filename_from_uri;
use crate::task::TaskDescription;

pub const IEXEC_IN: &str = "/iexec_in";
pub const IEXEC_OUT: &str = "/iexec_out";
pub const IEXEC_RESULT: &str = "/iexec_result";

pub const APP_HEAP: &str = "1G";
pub const POST_COMPUTE_HEAP: &str = "3G";

/// Variables every application container receives
pub fn task_env(description: &TaskDescription) -> Vec<String> {
    let mut env = vec![
        format!("IEXEC_IN={}", IEXEC_IN),
        format!("IEXEC_OUT={}", IEXEC_OUT),
        format!(
            "IEXEC_DATASET_FILENAME={}",
            if description.has_dataset() {
                description.dataset_filename()
            } else {
                String::new()
            }
        ),
        format!("IEXEC_BOT_SIZE={}", description.bot_size),
        format!("IEXEC_BOT_FIRST_INDEX={}", description.bot_first_index),
        format!("IEXEC_BOT_TASK_INDEX={}", description.bot_index),
        format!("IEXEC_NB_INPUT_FILES={}", description.input_files.len()),
    ];
    for (index, uri) in description.input_files.iter().enumerate() {
        env.push(format!(
            "IEXEC_INPUT_FILE_NAME_{}={}",
            index + 1,
            filename_from_uri(uri)
        ));
    }
    env.push(format!("IEXEC_INPUT_FILES_FOLDER={}", IEXEC_IN));
    env
}

/// SCONE runtime settings of an enclave container
pub fn scone_env(config_id: &str, cas_url: &str, las_url: &str, heap: &str) -> Vec<String> {
    vec![
        format!("SCONE_CAS_ADDR={}", cas_url),
        format!("SCONE_LAS_ADDR={}", las_url),
        format!("SCONE_CONFIG_ID={}", config_id),
        format!("SCONE_HEAP={}", heap),
        "SCONE_LOG=7".to_string(),
        "SCONE_VERSION=1".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AppType;

    fn description() -> TaskDescription {
        TaskDescription {
            chain_task_id: "0xabc".to_string(),
            app_type: AppType::Docker,
            app_uri: "alpine:3".to_string(),
            cmd: String::new(),
            max_execution_time: 60,
            dataset_uri: "https://host/datasets/iris.csv".to_string(),
            input_files: vec![
                "https://host/a.txt".to_string(),
                "https://host/dir/b.json?v=2".to_string(),
            ],
            is_tee_task: false,
            tee_post_compute_image: String::new(),
            bot_size: 10,
            bot_first_index: 20,
            bot_index: 23,
            developer_logger_enabled: false,
            callback: String::new(),
        }
    }

    #[test]
    fn test_task_env() {
        let env = task_env(&description());
        assert_eq!(
            env,
            vec![
                "IEXEC_IN=/iexec_in",
                "IEXEC_OUT=/iexec_out",
                "IEXEC_DATASET_FILENAME=iris.csv",
                "IEXEC_BOT_SIZE=10",
                "IEXEC_BOT_FIRST_INDEX=20",
                "IEXEC_BOT_TASK_INDEX=23",
                "IEXEC_NB_INPUT_FILES=2",
                "IEXEC_INPUT_FILE_NAME_1=a.txt",
                "IEXEC_INPUT_FILE_NAME_2=b.json",
                "IEXEC_INPUT_FILES_FOLDER=/iexec_in",
            ]
        );
    }

    #[test]
    fn test_task_env_without_dataset() {
        let mut description = description();
        description.dataset_uri.clear();
        description.input_files.clear();
        let env = task_env(&description);
        assert!(env.contains(&"IEXEC_DATASET_FILENAME=".to_string()));
        assert!(env.contains(&"IEXEC_NB_INPUT_FILES=0".to_string()));
        assert!(!env.iter().any(|v| v.starts_with("IEXEC_INPUT_FILE_NAME_")));
    }

    #[test]
    fn test_scone_env() {
        let env = scone_env("session/app", "cas:18765", "las:18766", APP_HEAP);
        assert!(env.contains(&"SCONE_CONFIG_ID=session/app".to_string()));
        assert!(env.contains(&"SCONE_HEAP=1G".to_string()));
        assert!(env.contains(&"SCONE_CAS_ADDR=cas:18765".to_string()));
    }
}
