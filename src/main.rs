fn main() {
    std::process::exit(stu::run::run());
}
