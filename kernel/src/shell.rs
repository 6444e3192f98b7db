//! Interactive kernel shell
//!
//! Not part of the core: a console loop that exercises the VFS, the
//! scheduler, and the ELF loader. Runs as the bootstrap kernel task.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::{
    drivers::keyboard,
    error::FsError,
    fs::{self, join_cwd, list_dir, NodeKind, VfsNode},
    sched, test_tasks,
};

const PROMPT: &str = "obsidian";

/// Run the shell forever.
pub fn run() -> ! {
    println!();
    println!("Type 'help' for commands.");
    let mut cwd = String::from("/");
    loop {
        print!("{}:{}$ ", PROMPT, cwd);
        let line = read_line();
        execute(&mut cwd, line.trim());
    }
}

/// Blocking line input with echo and backspace handling.
fn read_line() -> String {
    let mut line = String::new();
    loop {
        let Some(byte) = keyboard::pop_key() else {
            sched::block_hlt();
            continue;
        };
        match byte {
            b'\n' => {
                println!();
                return line;
            }
            0x08 | 0x7F => {
                if line.pop().is_some() {
                    print!("\x08");
                }
            }
            b' '..=b'~' => {
                line.push(byte as char);
                print!("{}", byte as char);
            }
            _ => {}
        }
    }
}

fn execute(cwd: &mut String, line: &str) {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return;
    };
    let args: Vec<&str> = parts.collect();

    let result = match cmd {
        "help" => {
            println!("ls cat cd pwd mkdir touch rm rmdir mv run demo ticks clear help");
            Ok(())
        }
        "pwd" => {
            println!("{}", cwd);
            Ok(())
        }
        "clear" => {
            crate::arch::x86_64::vga::clear_screen();
            Ok(())
        }
        "ticks" => {
            println!("{}", crate::arch::x86_64::timer::ticks());
            Ok(())
        }
        "ls" => cmd_ls(cwd, args.first().copied()),
        "cat" => cmd_cat(cwd, &args),
        "cd" => cmd_cd(cwd, args.first().copied()),
        "mkdir" => with_path(cwd, &args, |path| {
            fs::ensure_path_exists(path).map(|_| ())
        }),
        "touch" => with_path(cwd, &args, cmd_touch),
        "rm" => with_path(cwd, &args, |path| {
            let (parent, name) = parent_of(path)?;
            parent.unlink(name)
        }),
        "rmdir" => with_path(cwd, &args, |path| {
            let (parent, name) = parent_of(path)?;
            parent.rmdir(name)
        }),
        "mv" => cmd_mv(cwd, &args),
        "run" => cmd_run(cwd, &args),
        "demo" => cmd_demo(),
        _ => {
            println!("{}: unknown command", cmd);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("{}: error: {:?}", cmd, e);
    }
}

fn with_path(
    cwd: &str,
    args: &[&str],
    f: impl FnOnce(&str) -> Result<(), FsError>,
) -> Result<(), FsError> {
    let Some(arg) = args.first() else {
        return Err(FsError::InvalidPath);
    };
    f(&join_cwd(cwd, arg))
}

fn parent_of(path: &str) -> Result<(Arc<dyn VfsNode>, &str), FsError> {
    let (parent, name) = fs::split_path(path)?;
    let parent_node = fs::resolve_path(parent)?;
    Ok((parent_node, name))
}

fn cmd_ls(cwd: &str, arg: Option<&str>) -> Result<(), FsError> {
    let path = join_cwd(cwd, arg.unwrap_or("."));
    let node = if arg.is_some() {
        fs::resolve_path(&path)?
    } else {
        fs::resolve_path(cwd)?
    };
    for entry in list_dir(&node)? {
        match entry.kind {
            NodeKind::Directory => println!("{}/", entry.name),
            NodeKind::File => println!("{}", entry.name),
        }
    }
    Ok(())
}

fn cmd_cat(cwd: &str, args: &[&str]) -> Result<(), FsError> {
    for arg in args {
        let node = fs::resolve_path(&join_cwd(cwd, arg))?;
        let mut offset = 0u32;
        let mut buf = [0u8; 512];
        loop {
            let n = node.read(offset, &mut buf)?;
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                print!("{}", byte as char);
            }
            offset += n as u32;
        }
    }
    Ok(())
}

fn cmd_cd(cwd: &mut String, arg: Option<&str>) -> Result<(), FsError> {
    let target = join_cwd(cwd, arg.unwrap_or("/"));
    let node = fs::resolve_path(&target)?;
    if node.kind() != NodeKind::Directory {
        return Err(FsError::NotADirectory);
    }
    *cwd = target;
    Ok(())
}

fn cmd_touch(path: &str) -> Result<(), FsError> {
    match fs::resolve_path(path) {
        Ok(_) => Ok(()),
        Err(FsError::NotFound) => {
            let (parent, name) = parent_of(path)?;
            parent.create_file(name).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

fn cmd_mv(cwd: &str, args: &[&str]) -> Result<(), FsError> {
    let (Some(old), Some(new)) = (args.first(), args.get(1)) else {
        return Err(FsError::InvalidPath);
    };
    let old_path = join_cwd(cwd, old);
    let new_path = join_cwd(cwd, new);
    let (old_parent, old_name) = parent_of(&old_path)?;
    let (new_parent, new_name) = parent_of(&new_path)?;
    old_parent.rename(old_name, new_parent.inode(), new_name)
}

fn cmd_run(cwd: &str, args: &[&str]) -> Result<(), FsError> {
    let Some(arg) = args.first() else {
        return Err(FsError::InvalidPath);
    };
    let node = fs::resolve_path(&join_cwd(cwd, arg))?;
    match sched::create_user_task(&node) {
        Ok(id) => {
            println!("task {} started", id);
            Ok(())
        }
        Err(e) => {
            println!("run: {}", e);
            Ok(())
        }
    }
}

fn cmd_demo() -> Result<(), FsError> {
    match test_tasks::spawn_counters() {
        Ok(()) => {
            println!("counter tasks started; shared page at {:#x}", crate::mm::SHARED_PAGE);
            Ok(())
        }
        Err(e) => {
            println!("demo: {}", e);
            Ok(())
        }
    }
}
