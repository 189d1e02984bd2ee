//! Stock commands of the fabricated system

use super::{Command, ExecContext};
use crate::os::fs::VirtualFs;

/// `pwd`
#[derive(Debug)]
pub struct Pwd;

impl Command for Pwd {
    fn execute(&self, _args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let cwd = exec.ctx.cwd().to_string();
        exec.println(&cwd);
        0
    }
}

/// `whoami`
#[derive(Debug)]
pub struct Whoami;

impl Command for Whoami {
    fn execute(&self, _args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let user = exec.ctx.identity().user.clone();
        exec.println(&user);
        0
    }
}

/// `id`
#[derive(Debug)]
pub struct Id;

impl Command for Id {
    fn execute(&self, _args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let id = exec.ctx.identity();
        let group = if id.gid == 0 { "root" } else { id.user.as_str() };
        let line = format!(
            "uid={}({}) gid={}({}) groups={}({})",
            id.uid, id.user, id.gid, group, id.gid, group
        );
        exec.println(&line);
        0
    }
}

/// `hostname`
#[derive(Debug)]
pub struct Hostname;

impl Command for Hostname {
    fn execute(&self, _args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let hostname = exec.ctx.identity().hostname.clone();
        exec.println(&hostname);
        0
    }
}

/// `uname [-a|-s|-n|-r|-v|-m|-o]`
#[derive(Debug)]
pub struct Uname;

impl Command for Uname {
    fn execute(&self, args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let hostname = exec.ctx.identity().hostname.clone();
        let version = "#1 SMP Debian 4.9.144-3.1 (2019-02-19)";
        let mut fields = Vec::new();

        for arg in args {
            let Some(flags) = arg.strip_prefix('-') else {
                exec.println(&format!("uname: extra operand '{}'", arg));
                return 1;
            };
            for flag in flags.chars() {
                match flag {
                    'a' => {
                        let all = format!(
                            "Linux {} 4.9.0-8-amd64 {} x86_64 GNU/Linux",
                            hostname, version
                        );
                        exec.println(&all);
                        return 0;
                    }
                    's' => fields.push("Linux".to_string()),
                    'n' => fields.push(hostname.clone()),
                    'r' => fields.push("4.9.0-8-amd64".to_string()),
                    'v' => fields.push(version.to_string()),
                    'm' => fields.push("x86_64".to_string()),
                    'o' => fields.push("GNU/Linux".to_string()),
                    other => {
                        exec.println(&format!("uname: invalid option -- '{}'", other));
                        return 1;
                    }
                }
            }
        }

        if fields.is_empty() {
            fields.push("Linux".to_string());
        }
        exec.println(&fields.join(" "));
        0
    }
}

/// `echo [-n] args...`
#[derive(Debug)]
pub struct Echo;

impl Command for Echo {
    fn execute(&self, args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let (newline, words) = match args.first().map(String::as_str) {
            Some("-n") => (false, &args[1..]),
            _ => (true, args),
        };

        let expanded: Vec<String> = words
            .iter()
            .map(|w| match w.strip_prefix('$') {
                Some(name) if !name.is_empty() => {
                    exec.ctx.env(name).unwrap_or_default().to_string()
                }
                _ => w.clone(),
            })
            .collect();

        exec.print(&expanded.join(" "));
        if newline {
            exec.print("\n");
        }
        0
    }
}

/// `env` / `printenv [NAME]`
#[derive(Debug)]
pub struct Env;

impl Command for Env {
    fn execute(&self, args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        if let Some(name) = args.first() {
            return match exec.ctx.env(name).map(str::to_string) {
                Some(value) => {
                    exec.println(&value);
                    0
                }
                None => 1,
            };
        }

        for (name, value) in exec.ctx.env_vars() {
            exec.println(&format!("{}={}", name, value));
        }
        0
    }
}

/// `ls [-a] [-l] [paths...]`
#[derive(Debug)]
pub struct Ls;

impl Command for Ls {
    fn execute(&self, args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let mut all = false;
        let mut long = false;
        let mut paths = Vec::new();
        for arg in args {
            match arg.strip_prefix('-') {
                Some(flags) if !flags.is_empty() => {
                    all |= flags.contains('a');
                    long |= flags.contains('l');
                }
                _ => paths.push(arg.clone()),
            }
        }
        if paths.is_empty() {
            paths.push(".".to_string());
        }

        let mut code = 0;
        let multiple = paths.len() > 1;
        for path in &paths {
            let resolved = exec.ctx.resolve(path);

            if exec.fs.exists(&resolved) && !exec.fs.is_dir(&resolved) {
                let size = exec.fs.file_size(&resolved).unwrap_or(0);
                let line = if long {
                    format!("-rw-r--r-- 1 root root {:>6} Feb 19  2019 {}", size, path)
                } else {
                    path.clone()
                };
                exec.println(&line);
                continue;
            }

            match exec.fs.read_dir(&resolved) {
                Ok(entries) => {
                    if multiple {
                        exec.println(&format!("{}:", path));
                    }
                    let mut names: Vec<String> = Vec::new();
                    if all {
                        names.push(".".to_string());
                        names.push("..".to_string());
                    }
                    for entry in entries {
                        if !all && entry.name.starts_with('.') {
                            continue;
                        }
                        if long {
                            let (mode, size) = if entry.is_dir {
                                ("drwxr-xr-x", 4096)
                            } else {
                                ("-rw-r--r--", entry.size)
                            };
                            exec.println(&format!(
                                "{} 1 root root {:>6} Feb 19  2019 {}",
                                mode, size, entry.name
                            ));
                        } else {
                            names.push(entry.name);
                        }
                    }
                    if !names.is_empty() && !long {
                        exec.println(&names.join("  "));
                    }
                }
                Err(_) => {
                    exec.println(&format!(
                        "ls: cannot access '{}': No such file or directory",
                        path
                    ));
                    code = 2;
                }
            }
        }
        code
    }
}

/// `cat files...`
#[derive(Debug)]
pub struct Cat;

impl Command for Cat {
    fn execute(&self, args: &[String], exec: &mut ExecContext<'_>) -> i32 {
        let mut code = 0;
        for path in args {
            let resolved = exec.ctx.resolve(path);
            if exec.fs.is_dir(&resolved) {
                exec.println(&format!("cat: {}: Is a directory", path));
                code = 1;
                continue;
            }
            match exec.fs.read_file(&resolved) {
                Ok(data) => exec.stdout.extend_from_slice(&data),
                Err(_) => {
                    exec.println(&format!("cat: {}: No such file or directory", path));
                    code = 1;
                }
            }
        }
        code
    }
}
