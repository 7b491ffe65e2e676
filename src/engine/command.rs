//! imapsync command line construction.

use crate::model::JobDescriptor;
use std::ffi::OsString;
use std::path::Path;
use time::macros::format_description;
use time::OffsetDateTime;

/// Replace anything that is not safe in a file name on every platform.
pub fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Per-job log file name: `imapsync_<stamp>_<id>_<user1>_to_<user2>.log`.
pub fn log_file_name(descriptor: &JobDescriptor, now: OffsetDateTime) -> String {
    let stamp = now
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!(
        "imapsync_{}_{}_{}_to_{}.log",
        stamp,
        sanitize(&descriptor.id),
        sanitize(&descriptor.source.user),
        sanitize(&descriptor.destination.user),
    )
}

pub fn build_args(
    descriptor: &JobDescriptor,
    log_dir: &Path,
    log_file: &str,
    extra_args: &[String],
) -> Vec<OsString> {
    let src = &descriptor.source;
    let dst = &descriptor.destination;
    let mut args: Vec<OsString> = [
        ("--host1", src.host.as_str()),
        ("--user1", src.user.as_str()),
        ("--password1", src.password.as_str()),
        ("--host2", dst.host.as_str()),
        ("--user2", dst.user.as_str()),
        ("--password2", dst.password.as_str()),
    ]
    .into_iter()
    .flat_map(|(flag, value)| [OsString::from(flag), OsString::from(value)])
    .collect();
    args.push("--logdir".into());
    args.push(log_dir.as_os_str().to_owned());
    args.push("--logfile".into());
    args.push(log_file.into());
    args.extend(extra_args.iter().map(OsString::from));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;
    use time::macros::datetime;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            id: "job/1".into(),
            source: Endpoint {
                host: "h1".into(),
                user: "alice@old.example".into(),
                password: "p1".into(),
            },
            destination: Endpoint {
                host: "h2".into(),
                user: "Alice Smith".into(),
                password: "p2".into(),
            },
        }
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("a/b\\c:d*e?f"), "a_b_c_d_e_f");
        assert_eq!(sanitize("user.name-1_x"), "user.name-1_x");
        assert_eq!(sanitize(""), "_");
    }

    #[test]
    fn log_file_name_embeds_stamp_id_and_users() {
        let name = log_file_name(&descriptor(), datetime!(2026-10-19 08:05:09 UTC));
        assert_eq!(
            name,
            "imapsync_20261019_080509_job_1_alice_old.example_to_Alice_Smith.log"
        );
    }

    #[test]
    fn args_follow_imapsync_flag_order() {
        let args = build_args(
            &descriptor(),
            Path::new("/tmp/logs"),
            "x.log",
            &["--ssl1".to_string()],
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--host1",
                "h1",
                "--user1",
                "alice@old.example",
                "--password1",
                "p1",
                "--host2",
                "h2",
                "--user2",
                "Alice Smith",
                "--password2",
                "p2",
                "--logdir",
                "/tmp/logs",
                "--logfile",
                "x.log",
                "--ssl1",
            ]
        );
    }
}
