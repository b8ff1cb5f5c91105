//! crucible-curl: fetch URLs concurrently through one session.

use std::io::Write;
use std::path::Path;
use std::process;

use getopts::{Matches, Options};
use tokio::task::JoinSet;

use crucible_curl::{config, logging, quick, Config, Error, Headers, Request, RequestOption, Session};

#[derive(Clone)]
struct Fetch {
    headers: Vec<String>,
    method: Option<String>,
    data: Option<String>,
    follow: bool,
    include: bool,
    verbose: bool,
}

struct Fetched {
    code: u32,
    headers: Option<Headers>,
    body: Vec<u8>,
}

impl Fetch {
    fn from_matches(matches: &Matches) -> Self {
        Self {
            headers: matches.opt_strs("header"),
            method: matches.opt_str("request"),
            data: matches.opt_str("data"),
            follow: matches.opt_present("location"),
            include: matches.opt_present("include"),
            verbose: matches.opt_present("verbose"),
        }
    }

    fn build(&self, url: &str) -> Result<Request, Error> {
        let mut request = Request::get(url)?;
        if let Some(data) = &self.data {
            request.set_option(RequestOption::Post)?;
            request.set_option(RequestOption::PostFieldSize(data.len() as u64))?;
            // no 100-continue round trip for bodies we already have
            request.append_header("Expect:")?;
        }
        if let Some(method) = &self.method {
            request.set_option(RequestOption::CustomRequest(method.clone()))?;
        }
        request.set_option(RequestOption::FollowLocation(self.follow))?;
        request.set_option(RequestOption::Verbose(self.verbose))?;
        for line in &self.headers {
            request.append_header(line)?;
        }
        Ok(request)
    }

    async fn run(&self, session: &Session, url: &str) -> Result<Fetched, Error> {
        let mut request = self.build(url)?;
        let response = session.start(&mut request).await?;

        let upload = async {
            if let Some(data) = &self.data {
                quick::write_all(&request, data.as_bytes()).await?;
                request.shutdown().await?;
            }
            Ok::<_, Error>(())
        };
        let download = async {
            // without redirects followed, a redirect body has to be read
            // before another header block could show up
            let headers = if self.follow {
                response.wait_last_headers().await?
            } else {
                response.wait_headers().await?
            };
            let body = quick::read_to_end(&response).await?;
            Ok::<_, Error>((headers, body))
        };
        let (uploaded, downloaded) = tokio::join!(upload, download);
        uploaded?;
        let (headers, body) = downloaded?;

        Ok(Fetched {
            code: response.response_code().await?,
            headers,
            body,
        })
    }
}

fn options() -> Options {
    let mut opts = Options::new();
    opts.optopt("c", "config", "load configuration from FILE", "FILE");
    opts.optmulti("H", "header", "add a request header line", "LINE");
    opts.optopt("X", "request", "use METHOD instead of GET/POST", "METHOD");
    opts.optopt("d", "data", "send DATA as the POST body", "DATA");
    opts.optflag("L", "location", "follow redirects");
    opts.optflag("i", "include", "print response headers");
    opts.optflag("v", "verbose", "let libcurl trace the transfer");
    opts.optflag("", "print-config", "print the default configuration and exit");
    opts.optflag("h", "help", "print this help menu");
    opts
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {program} [options] URL...");
    print!("{}", opts.usage(&brief));
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().cloned().unwrap_or_else(|| "crucible-curl".to_string());
    let opts = options();

    let matches = match opts.parse(args.iter().skip(1)) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{e}");
            print_usage(&program, &opts);
            process::exit(1);
        }
    };

    if matches.opt_present("help") {
        print_usage(&program, &opts);
        return;
    }
    if matches.opt_present("print-config") {
        print!("{}", config::default_config());
        return;
    }
    if matches.free.is_empty() {
        print_usage(&program, &opts);
        process::exit(1);
    }

    let config = match matches.opt_str("config") {
        Some(path) => match Config::load(Path::new(&path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            process::exit(1);
        }
    };

    let fetch = Fetch::from_matches(&matches);
    let failures = runtime.block_on(run(config, fetch, matches.free.clone()));
    if failures > 0 {
        process::exit(1);
    }
}

/// Fetch every URL, printing results in argument order. Returns the number
/// of failed transfers.
async fn run(config: Config, fetch: Fetch, urls: Vec<String>) -> usize {
    let session = match Session::with_config(config.session) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to start session");
            return urls.len();
        }
    };

    let mut tasks = JoinSet::new();
    for (index, url) in urls.into_iter().enumerate() {
        let session = session.clone();
        let fetch = fetch.clone();
        tasks.spawn(async move {
            let result = fetch.run(&session, &url).await;
            (index, url, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!(error = %e, "fetch task failed"),
        }
    }
    results.sort_by_key(|(index, _, _)| *index);

    let mut failures = 0;
    let mut stdout = std::io::stdout().lock();
    for (_, url, result) in results {
        match result {
            Ok(fetched) => {
                tracing::info!(url = %url, code = fetched.code, bytes = fetched.body.len(), "fetched");
                if fetch.include {
                    if let Some(headers) = &fetched.headers {
                        let _ = writeln!(stdout, "HTTP {}", fetched.code);
                        for (name, value) in headers.iter() {
                            let _ = writeln!(stdout, "{name}: {value}");
                        }
                        let _ = writeln!(stdout);
                    }
                }
                let _ = stdout.write_all(&fetched.body);
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "fetch failed");
                failures += 1;
            }
        }
    }
    let _ = stdout.flush();
    failures
}
