// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

//! The `ar-container` binary. When the runtime launches a container it
//! bind-mounts this same binary at `/.dockerinit` inside the rootfs; an
//! invocation through that path (or `/sbin/init`) is dispatched into the
//! in-container init routine. Every other entrypoint of the runtime is a
//! typed operation on the `arc` library.

use anyhow::Context;
use arc::sysinit::{sys_init, InitOptions};
use clap::Parser;

/// Flags accepted by the in-container init, everything after `--` being
/// the program to exec.
#[derive(Parser, Debug)]
#[command(name = "dockerinit", disable_help_flag = true)]
struct InitArgs {
    /// username or uid
    #[arg(short = 'u')]
    user: Option<String>,
    /// gateway address
    #[arg(short = 'g')]
    gateway: Option<String>,
    /// ipv6 gateway address
    #[arg(long = "g6")]
    gateway6: Option<String>,
    /// environment variables
    #[arg(short = 'e')]
    env: Vec<String>,
    /// program and arguments
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn self_path() -> String {
    std::env::args().next().unwrap_or_default()
}

fn run_init() -> ! {
    if std::env::args().len() <= 1 {
        eprintln!("you should not invoke the container init manually");
        std::process::exit(1);
    }

    // the launcher renders the documented single-dash -g6 flag
    let argv = std::env::args().map(|arg| {
        if arg == "-g6" {
            "--g6".to_string()
        } else {
            arg
        }
    });
    let args = InitArgs::parse_from(argv);

    let mut command = args.command.into_iter();
    let Some(program) = command.next() else {
        eprintln!("no program to execute");
        std::process::exit(1);
    };

    let opts = InitOptions {
        user: args.user,
        gateway: args.gateway,
        gateway6: args.gateway6,
        env: args.env,
        program,
        args: command.collect(),
    };

    match sys_init(opts) {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn init_runtime() -> anyhow::Result<()> {
    let runtime = arc::config::Runtime::new();
    runtime
        .ensure_layout()
        .with_context(|| format!("unable to create the runtime layout under {}", arc::config::DIR))
}

fn main() {
    let self_path = self_path();
    if self_path == "/sbin/init" || self_path == "/.dockerinit" {
        // running in init mode inside a container
        run_init();
    }

    tracing_subscriber::fmt::init();

    if let Err(err) = init_runtime() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }

    eprintln!(
        "ar-container: the runtime is driven through the arc library; \
         this binary only provides the in-container init entrypoint"
    );
    std::process::exit(2);
}
